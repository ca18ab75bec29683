use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Advisory locks keyed by volume name.
///
/// Entries are dropped once the last holder or waiter releases them.
#[derive(Default)]
pub struct NameLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
    entry: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> NameGuard<'_> {
        let entry = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(name.to_string()).or_default().clone()
        };
        let guard = entry.clone().lock_owned().await;
        NameGuard { locks: self, name: name.to_string(), entry, guard: Some(guard) }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        // The map and this guard hold the only references: nobody is waiting.
        if Arc::strong_count(&self.entry) == 2 {
            map.remove(&self.name);
        }
    }
}
