use std::{collections::BTreeMap, ops::Bound};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::storage::{
    error::StorageError,
    remote::blob::{BlobStore, DELETE_BATCH, ListPage, Metadata, StoredBlob},
};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// In-process [`BlobStore`] with S3-like listing semantics.
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
    page_size: usize,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Listing returns at most `page_size` entries (keys plus common prefixes) per page.
    pub fn with_page_size(page_size: usize) -> Self {
        MemoryBlobStore {
            blobs: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes, metadata: Metadata) -> Result<(), StorageError> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), StoredBlob { data, metadata });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredBlob>, StorageError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn head(&self, key: &str) -> Result<Option<Metadata>, StorageError> {
        Ok(self.blobs.read().await.get(key).map(|b| b.metadata.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.len() > DELETE_BATCH {
            return Err(StorageError::InvalidRequest(format!(
                "batch delete of {} keys exceeds {DELETE_BATCH}",
                keys.len()
            )));
        }
        let mut blobs = self.blobs.write().await;
        for key in keys {
            blobs.remove(key);
        }
        Ok(())
    }

    /// The continuation token is the last key or prefix returned.
    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ListPage, StorageError> {
        let blobs = self.blobs.read().await;
        let start = match &continuation {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut page = ListPage::default();
        let mut last = None;
        for key in blobs
            .range((start, Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
        {
            let rolled = delimiter.and_then(|d| {
                key[prefix.len()..]
                    .find(d)
                    .map(|pos| key[..prefix.len() + pos + d.len()].to_string())
            });
            if let Some(group) = rolled {
                if last.as_deref() == Some(group.as_str()) {
                    continue;
                }
                // Keys inside an already returned group sort after the token; skip them.
                if continuation
                    .as_deref()
                    .is_some_and(|t| t.ends_with(delimiter.unwrap_or_default()) && key.starts_with(t))
                {
                    continue;
                }
                if page.keys.len() + page.common_prefixes.len() == self.page_size {
                    page.next = last;
                    return Ok(page);
                }
                page.common_prefixes.push(group.clone());
                last = Some(group);
            } else {
                if page.keys.len() + page.common_prefixes.len() == self.page_size {
                    page.next = last;
                    return Ok(page);
                }
                page.keys.push(key.clone());
                last = Some(key.clone());
            }
        }
        Ok(page)
    }
}
