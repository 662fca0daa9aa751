use chrono::NaiveDate;
use tracing::{info, warn};

use crate::limits::*;
use crate::model::*;
use crate::observability::SAVE_DAY_ORPHANS_TOTAL;

use super::normalize::normalize;
use super::{Engine, EngineError};

impl Engine {
    /// Free intervals of one day, sorted by start.
    pub async fn get_day_schedule(&self, owner_id: OwnerId, date: NaiveDate) -> Vec<FreeInterval> {
        self.store.read_day(DayKey::new(owner_id, date)).await.free
    }

    /// Free intervals for `[start_date, start_date + day_count)`. Days without
    /// free time are left out. A non-positive `day_count` means one day.
    pub async fn get_range_schedule(
        &self,
        owner_id: OwnerId,
        start_date: NaiveDate,
        day_count: i64,
    ) -> Result<ScheduleRange, EngineError> {
        let day_count = day_count.max(1);
        if day_count > MAX_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("schedule range too wide"));
        }
        let mut out = ScheduleRange::new();
        for state in self.store.read_days(owner_id, start_date, day_count as u64).await {
            if !state.free.is_empty() {
                out.insert(state.day.date, state.free);
            }
        }
        Ok(out)
    }

    /// Replace a day's free intervals with the normalized submission and return
    /// the inserted rows. Existing appointments are left alone.
    pub async fn save_day_schedule(
        &self,
        owner_id: OwnerId,
        date: NaiveDate,
        ranges: &[TimeRangeInput],
    ) -> Result<Vec<FreeInterval>, EngineError> {
        let spans = normalize(ranges)?;

        let day = DayKey::new(owner_id, date);
        let mut txn = self.store.begin(day).await?;
        let previous: Vec<_> = txn.free_intervals().iter().map(|i| i.id).collect();
        for id in &previous {
            txn.delete_free(*id)?;
        }
        let mut inserted = Vec::with_capacity(spans.len());
        for span in &spans {
            inserted.push(txn.insert_free(*span)?);
        }

        let orphaned = txn
            .appointments()
            .iter()
            .filter(|a| spans.iter().any(|s| s.overlaps(&a.span)))
            .count();
        if orphaned > 0 {
            metrics::counter!(SAVE_DAY_ORPHANS_TOTAL).increment(orphaned as u64);
            warn!(%day, appointments = orphaned, "saved availability overlaps booked appointments");
        }

        self.commit(txn, TxnKind::SaveDay).await?;
        info!(%day, replaced = previous.len(), inserted = inserted.len(), "day schedule saved");
        Ok(inserted)
    }

    /// Every appointment of the owner, ordered by date then start.
    pub async fn list_appointments(&self, owner_id: OwnerId) -> Vec<Appointment> {
        self.store.appointments_for(owner_id).await
    }

    pub async fn register_service(&self, service: ServiceInfo) -> Result<(), EngineError> {
        self.catalog.register(service).await
    }

    pub fn list_services(&self, owner_id: OwnerId) -> Vec<ServiceInfo> {
        self.catalog.services_for(owner_id)
    }
}
