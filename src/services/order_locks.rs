use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Per-order async mutexes. Everything that changes an order or its
/// payments holds the order's guard, so intent creation, reconciliation,
/// cancellation and refunds for one order run one at a time within this
/// process. Row locks inside the transaction cover other processes.
#[derive(Debug, Default, Clone)]
pub struct OrderLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, order_id: Uuid) -> OrderGuard {
        let lock = self
            .locks
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        OrderGuard {
            guard: Some(lock.lock_owned().await),
            order_id,
            locks: self.locks.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Releases the order lock on drop and forgets the entry once nobody else
/// is waiting on it.
pub struct OrderGuard {
    guard: Option<OwnedMutexGuard<()>>,
    order_id: Uuid,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Drop for OrderGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's reference is left when no task holds or awaits the lock.
        self.locks
            .remove_if(&self.order_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
