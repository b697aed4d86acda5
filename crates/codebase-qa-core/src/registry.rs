//! Registry mapping codebase identifiers to their [`CodebaseIndex`].
//!
//! Each codebase id owns one slot: a `OnceCell` that is initialized at
//! most once. The map lock is held only long enough to find or insert the
//! slot; opening the index (which may read the chunk store) happens under
//! the slot's own initialization lock, so concurrent first access to
//! different ids never serializes, and concurrent first access to the
//! same id constructs exactly one index.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::embedding::Embedder;
use crate::error::{QaError, Result};
use crate::index::{CodebaseIndex, IndexOptions};
use crate::store::ChunkStore;

type Slot = Arc<OnceCell<Arc<CodebaseIndex>>>;

/// Owner of every live codebase index.
pub struct IndexRegistry {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore>,
    options: IndexOptions,
    slots: Mutex<HashMap<String, Slot>>,
}

impl IndexRegistry {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn ChunkStore>, options: IndexOptions) -> Self {
        Self {
            embedder,
            store,
            options,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the index for `codebase_id`, opening it on first use.
    pub async fn get_or_create(&self, codebase_id: &str) -> Result<Arc<CodebaseIndex>> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(codebase_id.to_string()).or_default().clone()
        };

        let index = slot
            .get_or_try_init(|| async {
                let index = CodebaseIndex::open(
                    codebase_id,
                    self.embedder.clone(),
                    self.store.clone(),
                    self.options,
                )
                .await?;
                Ok::<_, QaError>(Arc::new(index))
            })
            .await?;
        Ok(index.clone())
    }

    /// Return the index for `codebase_id` if it has been opened.
    pub async fn get(&self, codebase_id: &str) -> Result<Arc<CodebaseIndex>> {
        let slots = self.slots.lock().await;
        slots
            .get(codebase_id)
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| QaError::NotFound(codebase_id.to_string()))
    }

    /// Destroy and unregister the index. Deleting an unknown id is a no-op.
    ///
    /// Persisted chunks are dropped even if the index was never opened in
    /// this process.
    pub async fn delete(&self, codebase_id: &str) -> Result<()> {
        let slot = self.slots.lock().await.remove(codebase_id);

        match slot.as_ref().and_then(|s| s.get()) {
            Some(index) => match index.destroy().await {
                Ok(()) | Err(QaError::IndexDestroyed(_)) => {}
                Err(e) => return Err(e),
            },
            None => self.store.drop_codebase(codebase_id).await?,
        }
        info!(codebase_id, "deleted codebase index");
        Ok(())
    }

    /// Identifiers of every opened index.
    pub async fn list_ids(&self) -> BTreeSet<String> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
