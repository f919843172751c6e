use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async lock table serializing work on the same folder or record.
#[derive(Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(
        &self,
        account: &str,
        space_id: Option<&str>,
        folder_path: &str,
    ) -> OwnedMutexGuard<()> {
        self.lock_key(format!(
            "folder\n{account}\n{}\n{folder_path}",
            space_id.unwrap_or_default()
        ))
        .await
    }

    pub async fn lock_record(&self, id: i64) -> OwnedMutexGuard<()> {
        self.lock_key(format!("record\n{id}")).await
    }

    async fn lock_key(&self, key: String) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            // Drop entries nobody holds or waits for.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key).or_default().clone()
        };
        entry.lock_owned().await
    }
}
