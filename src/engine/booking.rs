use chrono::Utc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_FIELD_LEN;
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;

use super::{Engine, EngineError};

impl Engine {
    /// Claim `[start, end)` out of the free interval covering it.
    ///
    /// The covering interval is replaced by up to two leftover fragments and the
    /// appointment is recorded, all in one transaction on the day bucket.
    pub async fn book_appointment(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        let span = Span::checked(request.start, request.end).ok_or_else(|| {
            EngineError::InvalidRange(format_time(request.start), format_time(request.end))
        })?;
        validate_customer(&request.customer)?;
        if self.catalog.owner_of(request.service_id) != Some(request.owner_id) {
            return Err(EngineError::ServiceNotFound {
                service_id: request.service_id,
                owner_id: request.owner_id,
            });
        }

        let day = DayKey::new(request.owner_id, request.date);
        let mut txn = self.store.begin(day).await?;

        let candidates = txn.containing(&span);
        if candidates.len() > 1 {
            warn!(%day, %span, candidates = candidates.len(), "several free intervals cover request, taking earliest");
        }
        let Some(matched) = candidates.into_iter().next() else {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "no_slot").increment(1);
            debug!(%day, %span, "no free interval covers request");
            return Err(EngineError::NoAvailableSlot {
                date: request.date,
                span,
            });
        };

        txn.delete_free(matched.id)?;
        if matched.span.start != span.start {
            txn.insert_free(Span::new(matched.span.start, span.start))?;
        }
        if span.end != matched.span.end {
            txn.insert_free(Span::new(span.end, matched.span.end))?;
        }

        let appointment = Appointment {
            id: Ulid::new(),
            owner_id: request.owner_id,
            service_id: request.service_id,
            date: request.date,
            span,
            customer: request.customer,
            created_at: Utc::now(),
        };
        txn.insert_appointment(appointment.clone())?;
        self.commit(txn, TxnKind::Book).await?;

        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "booked").increment(1);
        info!(id = %appointment.id, %day, %span, from = %matched.span, "appointment booked");
        Ok(appointment)
    }
}

fn validate_customer(customer: &Customer) -> Result<(), EngineError> {
    let required = [
        ("first_name", &customer.first_name),
        ("last_name", &customer.last_name),
        ("email", &customer.email),
        ("phone", &customer.phone),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(EngineError::MissingField(name));
        }
        if value.len() > MAX_FIELD_LEN {
            return Err(EngineError::LimitExceeded("customer field too long"));
        }
    }
    if let Some(handle) = &customer.handle
        && handle.len() > MAX_FIELD_LEN
    {
        return Err(EngineError::LimitExceeded("customer field too long"));
    }
    Ok(())
}
