//! Sled-based storage for document content.
//!
//! Content is stored as UTF-8 bytes keyed by document id, with a bincode
//! metadata record in a separate tree.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{DocumentMetadata, DocumentStorage, StorageConfig, StorageError, StorageResult};

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_METADATA: &str = "metadata";

/// Sled-based document store
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<Db>,
    documents: Tree,
    metadata: Tree,
}

impl DocumentStore {
    /// Open or create a new document store at the given path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            metadata,
        })
    }

    pub fn save_document(&self, document_id: &str, content: &str) -> StorageResult<()> {
        self.documents
            .insert(document_id.as_bytes(), content.as_bytes())?;

        let mut meta = self
            .get_metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));
        meta.touch(content.len());
        self.save_metadata(&meta)?;

        Ok(())
    }

    pub fn load_document(&self, document_id: &str) -> StorageResult<Option<String>> {
        match self.documents.get(document_id.as_bytes())? {
            Some(data) => {
                let content = String::from_utf8(data.to_vec())
                    .map_err(|_| StorageError::Corruption(document_id.to_string()))?;
                Ok(Some(content))
            }
            None => Ok(None),
        }
    }

    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.document_id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_metadata(&self, document_id: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStorage for DocumentStore {
    async fn load_initial_content(&self, document_id: &str) -> StorageResult<Option<String>> {
        self.load_document(document_id)
    }

    async fn persist(&self, document_id: &str, content: &str) -> StorageResult<()> {
        self.save_document(document_id, content)?;
        debug!("Persisted document {} ({} bytes)", document_id, content.len());
        Ok(())
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
