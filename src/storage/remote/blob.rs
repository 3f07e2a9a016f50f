//! Flat key/value blob store abstraction the remote backend is written against.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::error::StorageError;

pub type Metadata = HashMap<String, String>;

/// Most keys a single batched delete may carry.
pub const DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub data: Bytes,
    pub metadata: Metadata,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Groups rolled up by the delimiter, each ending with it.
    pub common_prefixes: Vec<String>,
    /// Continuation token for the next page.
    pub next: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, key: &str, data: Bytes, metadata: Metadata) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<StoredBlob>, StorageError>;

    /// Metadata of `key` without its body.
    async fn head(&self, key: &str) -> Result<Option<Metadata>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Deletes up to [`DELETE_BATCH`] keys in one request.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError>;

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ListPage, StorageError>;
}

/// Every key under `prefix`, following continuation tokens.
pub async fn list_all(store: &dyn BlobStore, prefix: &str) -> Result<Vec<String>, StorageError> {
    let mut keys = Vec::new();
    let mut continuation = None;
    loop {
        let page = store.list_page(prefix, None, continuation).await?;
        keys.extend(page.keys);
        match page.next {
            Some(token) => continuation = Some(token),
            None => return Ok(keys),
        }
    }
}

/// Deletes `keys` in batches of at most [`DELETE_BATCH`].
pub async fn delete_all(store: &dyn BlobStore, keys: &[String]) -> Result<(), StorageError> {
    for batch in keys.chunks(DELETE_BATCH) {
        store.delete_many(batch).await?;
    }
    Ok(())
}
