mod booking;
mod cancellation;
mod error;
mod normalize;
mod queries;
pub mod store;

pub use error::{EngineError, ErrorKind};
pub use normalize::normalize;
pub use store::{DayStore, IntervalStore, ServiceCatalog, Txn};

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::COMMITS_TOTAL;

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Keep absorbing neighbours after the first adjacency merge on cancel.
    pub chained_merge: bool,
}

/// Scheduling engine for one tenant. All persistence goes through the injected store.
pub struct Engine {
    pub(super) store: Arc<dyn IntervalStore>,
    pub(super) catalog: Arc<dyn ServiceCatalog>,
    pub notify: Arc<NotifyHub>,
    pub(super) options: EngineOptions,
}

impl Engine {
    pub fn new(
        store: Arc<dyn IntervalStore>,
        catalog: Arc<dyn ServiceCatalog>,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            catalog,
            notify,
            options,
        }
    }

    /// Engine over a `DayStore` acting as both interval store and service catalog.
    pub fn with_day_store(store: Arc<DayStore>, options: EngineOptions) -> Self {
        Self::new(
            store.clone(),
            store,
            Arc::new(NotifyHub::new()),
            options,
        )
    }

    /// Change feed of every committed write for one owner.
    pub fn subscribe(&self, owner_id: OwnerId) -> broadcast::Receiver<Event> {
        self.notify.subscribe(owner_id)
    }

    /// Commit + notify in one call.
    pub(super) async fn commit(&self, txn: Txn, kind: TxnKind) -> Result<(), EngineError> {
        if let Some(event) = self.store.commit(txn, kind).await? {
            metrics::counter!(COMMITS_TOTAL, "kind" => kind.label()).increment(1);
            self.notify.send(event.owner_id(), &event);
        }
        Ok(())
    }
}
