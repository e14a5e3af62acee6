//! Search backend contract.

use async_trait::async_trait;
use processor_core::Result;
use serde_json::Value;

use crate::index::{IndexMeta, SearchIndex};

/// How a document copy treats documents already present in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Replace documents with the same id.
    Overwrite,
    /// Only add documents missing from the destination.
    CreateOnly,
}

/// Operations the rotation state machine and the indexing worker need.
///
/// `swap_alias` must be a single atomic backend operation: readers see the
/// alias on the old targets or on the new index, never in between.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Every index named `<alias>-<timestamp>`, with its persisted state.
    async fn list_indices(&self, alias: &str) -> Result<Vec<SearchIndex>>;

    /// Indices the alias currently resolves to.
    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>>;

    async fn create_index(&self, name: &str, meta: &IndexMeta) -> Result<()>;

    async fn update_meta(&self, name: &str, meta: &IndexMeta) -> Result<()>;

    /// Copies documents from `source` (index or alias) into `dest`.
    /// Returns the number of documents written.
    async fn copy_documents(&self, source: &str, dest: &str, mode: CopyMode) -> Result<u64>;

    /// Refreshes `index` and returns its document count.
    async fn count(&self, index: &str) -> Result<u64>;

    /// Atomically removes `alias` from `remove` and points it at `add`.
    async fn swap_alias(&self, alias: &str, remove: &[String], add: &str) -> Result<()>;

    /// Deletes an index. Deleting a missing index is not an error.
    async fn delete_index(&self, name: &str) -> Result<()>;

    /// Writes a document through an alias.
    async fn index_document(&self, alias: &str, id: &str, document: &Value) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
