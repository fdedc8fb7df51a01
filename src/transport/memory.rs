//! In-memory pairing-state store. The default for tests and for hosts that
//! persist pairing blobs elsewhere.

use super::Datastore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryDatastore {
    blobs: Mutex<HashMap<Uuid, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn load(&self, session_id: Uuid) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(&session_id).cloned())
    }

    async fn store(&self, session_id: Uuid, blob: Vec<u8>) -> anyhow::Result<()> {
        self.blobs.lock().insert(session_id, blob);
        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> anyhow::Result<()> {
        self.blobs.lock().remove(&session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_load_delete_cycle() {
        let store = MemoryDatastore::new();
        let id = Uuid::new_v4();

        assert!(store.load(id).await.unwrap().is_none());

        store.store(id, b"pairing-state".to_vec()).await.unwrap();
        assert_eq!(
            store.load(id).await.unwrap().as_deref(),
            Some(b"pairing-state".as_slice())
        );
        assert_eq!(store.len(), 1);

        store.delete(id).await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
