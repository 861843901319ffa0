//! In-process storage backend.
//!
//! Used when no database path is configured and as the storage double in
//! tests, where loads and persists can be made to fail on demand.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{DocumentStorage, StorageError, StorageResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: DashMap<String, String>,
    fail_loads: AtomicBool,
    fail_persists: AtomicBool,
    persist_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_document(self, document_id: impl Into<String>, content: impl Into<String>) -> Self {
        self.documents.insert(document_id.into(), content.into());
        self
    }

    pub fn get(&self, document_id: &str) -> Option<String> {
        self.documents.get(document_id).map(|c| c.clone())
    }

    #[cfg(test)]
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set_fail_persists(&self, fail: bool) {
        self.fail_persists.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    /// Number of persist attempts, failed ones included
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStorage for MemoryStore {
    async fn load_initial_content(&self, document_id: &str) -> StorageResult<Option<String>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("load of {document_id} failed")));
        }
        Ok(self.get(document_id))
    }

    async fn persist(&self, document_id: &str, content: &str) -> StorageResult<()> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_persists.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("persist of {document_id} failed")));
        }
        self.documents
            .insert(document_id.to_string(), content.to_string());
        Ok(())
    }
}
