use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{CANCELLATIONS_TOTAL, INTERVALS_MERGED_TOTAL};

use super::store::Txn;
use super::{Engine, EngineError};

impl Engine {
    /// Remove an appointment and give its range back to the day as free time,
    /// absorbing free intervals that touch the range exactly at a boundary.
    pub async fn cancel_appointment(&self, appointment_id: Ulid, owner_id: OwnerId) -> Result<(), EngineError> {
        let day = self
            .store
            .locate_appointment(&appointment_id)
            .filter(|day| day.owner_id == owner_id)
            .ok_or(EngineError::AppointmentNotFound(appointment_id))?;

        let mut txn = self.store.begin(day).await?;
        // Fails with AppointmentNotFound if a concurrent cancel committed first.
        let appointment = txn.delete_appointment(appointment_id)?;
        let (restored, absorbed) = absorb_neighbours(&mut txn, appointment.span, self.options.chained_merge)?;
        txn.insert_free(restored)?;
        self.commit(txn, TxnKind::Cancel).await?;

        metrics::counter!(CANCELLATIONS_TOTAL).increment(1);
        metrics::counter!(INTERVALS_MERGED_TOTAL).increment(absorbed as u64);
        info!(id = %appointment_id, %day, span = %appointment.span, %restored, absorbed, "appointment cancelled");
        Ok(())
    }
}

/// Delete every free interval touching `span` and return the covering range.
///
/// One hop only: intervals touching the far edge of an absorbed neighbour stay
/// put unless `chained` is set, in which case the merged range is re-queried
/// until nothing new touches it.
fn absorb_neighbours(txn: &mut Txn, span: Span, chained: bool) -> Result<(Span, usize), EngineError> {
    // Free time already sitting inside the range means the day was re-saved
    // underneath this appointment. Fold it in rather than fail the cancel.
    let stale = txn.overlapping(&span);
    if !stale.is_empty() {
        warn!(day = %txn.day(), %span, intervals = stale.len(), "cancelled range overlaps existing free time");
    }

    let mut merged = span;
    let mut absorbed = 0;
    let mut batch = stale;
    batch.extend(txn.adjacent(&span));
    while !batch.is_empty() {
        for interval in batch {
            merged.start = merged.start.min(interval.span.start);
            merged.end = merged.end.max(interval.span.end);
            txn.delete_free(interval.id)?;
            absorbed += 1;
        }
        if !chained {
            break;
        }
        batch = txn.adjacent(&merged);
    }
    Ok((merged, absorbed))
}
