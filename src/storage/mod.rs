//! Storage collaborator for durable document content.
//!
//! The sync core treats storage as eventually-consistent backing: content is
//! loaded once when a session is created and persisted opportunistically. Two
//! backends ship with the server:
//! - [`DocumentStore`], a sled embedded database
//! - [`MemoryStore`], process-local and used by tests

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::DocumentStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected in document: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable backing for document content
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Content to seed a new session with; `None` for a document never persisted
    async fn load_initial_content(&self, document_id: &str) -> StorageResult<Option<String>>;

    async fn persist(&self, document_id: &str, content: &str) -> StorageResult<()>;
}

/// Metadata stored alongside document content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document identifier
    pub document_id: String,
    /// Unix timestamp of first persist
    pub created_at: i64,
    /// Unix timestamp of last persist
    pub updated_at: i64,
    /// Number of times the content was persisted
    pub persist_count: u64,
    /// Size of the content in bytes
    pub size_bytes: u64,
}

impl DocumentMetadata {
    pub fn new(document_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            document_id: document_id.into(),
            created_at: now,
            updated_at: now,
            persist_count: 0,
            size_bytes: 0,
        }
    }

    /// Record a persist of `size_bytes` bytes
    pub fn touch(&mut self, size_bytes: usize) {
        self.updated_at = chrono::Utc::now().timestamp();
        self.persist_count += 1;
        self.size_bytes = size_bytes as u64;
    }
}

/// Configuration for the sled storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/docsync.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}
