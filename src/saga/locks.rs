use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per creator. Sagas for the same creator queue behind each
/// other; different creators never contend.
#[derive(Debug, Default)]
pub struct CreatorLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CreatorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `creator_id`. Released on drop.
    pub async fn acquire(&self, creator_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only the map still references are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(creator_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Creators with a saga running or waiting.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}
