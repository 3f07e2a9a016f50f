//! Pack generation and ingestion for the smart protocol: walks the object graph behind the
//! wants, streams undeltified packs, and unpacks pushed packs (thin ones included) against the
//! repository.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{core::RepositoryAccess, types::ProtocolError};
use crate::{
    hash::ObjectHash,
    internal::{
        object::{
            ObjectTrait, commit::Commit, tag::Tag, tree::Tree, tree::TreeItemMode,
            types::ObjectType,
        },
        pack::{DecodedPack, Pack, encode::PackEncoder, entry::Entry},
    },
    storage::StorageError,
};

const PACK_CHANNEL_CAPACITY: usize = 64;

/// Pack generation service for Git protocol operations
pub struct PackGenerator<'a, R>
where
    R: RepositoryAccess,
{
    repo_access: &'a R,
}

impl<'a, R> PackGenerator<'a, R>
where
    R: RepositoryAccess,
{
    pub fn new(repo_access: &'a R) -> Self {
        Self { repo_access }
    }

    /// Every object reachable from `wants` that is not reachable from `haves`, plus the
    /// annotated tags among `tag_candidates` that point into that set.
    pub async fn collect_objects(
        &self,
        wants: &[ObjectHash],
        haves: &[ObjectHash],
        tag_candidates: &[ObjectHash],
    ) -> Result<Vec<Entry>, ProtocolError> {
        let excluded = self.reachable_ids(haves).await?;
        let mut included = HashSet::new();
        let mut entries = Vec::new();
        let mut pending: Vec<ObjectHash> = wants.iter().rev().copied().collect();

        while let Some(hash) = pending.pop() {
            if excluded.contains(&hash) || !included.insert(hash) {
                continue;
            }
            let object = self.repo_access.get_object(&hash).await?;
            match object.obj_type {
                ObjectType::Commit => {
                    let commit = parse::<Commit>(&object.data, hash)?;
                    pending.extend(commit.parent_commit_ids.iter().rev());
                    pending.push(commit.tree_id);
                }
                ObjectType::Tree => {
                    let tree = parse::<Tree>(&object.data, hash)?;
                    pending.extend(
                        tree.tree_items
                            .iter()
                            .rev()
                            .filter(|item| item.mode != TreeItemMode::Commit)
                            .map(|item| item.id),
                    );
                }
                ObjectType::Tag => {
                    let tag = parse::<Tag>(&object.data, hash)?;
                    pending.push(tag.object_hash);
                }
                _ => {}
            }
            entries.push(Entry::from(object));
        }

        for tag_id in tag_candidates {
            if included.contains(tag_id) || excluded.contains(tag_id) {
                continue;
            }
            let tag = self.repo_access.get_tag(tag_id).await?;
            if included.contains(&tag.object_hash) {
                included.insert(*tag_id);
                entries.push(Entry::from(self.repo_access.get_object(tag_id).await?));
            }
        }
        tracing::debug!(
            objects = entries.len(),
            excluded = excluded.len(),
            "collected pack objects"
        );
        Ok(entries)
    }

    /// Ids reachable from `roots`. Blobs are not loaded and objects missing from storage
    /// end the walk along that path.
    async fn reachable_ids(
        &self,
        roots: &[ObjectHash],
    ) -> Result<HashSet<ObjectHash>, ProtocolError> {
        let mut seen = HashSet::new();
        let mut pending: Vec<(ObjectHash, Option<ObjectType>)> =
            roots.iter().map(|h| (*h, None)).collect();
        while let Some((hash, hint)) = pending.pop() {
            if !seen.insert(hash) || hint == Some(ObjectType::Blob) {
                continue;
            }
            let object = match self.repo_access.get_object(&hash).await {
                Ok(object) => object,
                Err(ProtocolError::Storage(StorageError::NotFound(_))) => continue,
                Err(e) => return Err(e),
            };
            match object.obj_type {
                ObjectType::Commit => {
                    let commit = parse::<Commit>(&object.data, hash)?;
                    pending.push((commit.tree_id, Some(ObjectType::Tree)));
                    pending.extend(
                        commit
                            .parent_commit_ids
                            .iter()
                            .map(|p| (*p, Some(ObjectType::Commit))),
                    );
                }
                ObjectType::Tree => {
                    let tree = parse::<Tree>(&object.data, hash)?;
                    pending.extend(
                        tree.tree_items
                            .iter()
                            .filter(|item| item.mode != TreeItemMode::Commit)
                            .map(|item| (item.id, Some(item.mode.object_type()))),
                    );
                }
                ObjectType::Tag => {
                    let tag = parse::<Tag>(&object.data, hash)?;
                    pending.push((tag.object_hash, Some(tag.object_type)));
                }
                _ => {}
            }
        }
        Ok(seen)
    }

    /// Encodes `entries` on a background task; the receiver yields the pack in chunks,
    /// trailer last.
    pub fn generate_pack_stream(entries: Vec<Entry>) -> ReceiverStream<Vec<u8>> {
        let (pack_tx, pack_rx) = mpsc::channel(PACK_CHANNEL_CAPACITY);
        let (entry_tx, entry_rx) = mpsc::channel(PACK_CHANNEL_CAPACITY);
        let mut encoder = PackEncoder::new(entries.len(), pack_tx);

        tokio::spawn(async move {
            if let Err(e) = encoder.encode(entry_rx).await {
                tracing::error!(error = %e, "failed to encode pack");
            }
        });
        tokio::spawn(async move {
            for entry in entries {
                if entry_tx.send(entry).await.is_err() {
                    break;
                }
            }
        });

        ReceiverStream::new(pack_rx)
    }

    /// Decodes a pushed pack, completing thin deltas with bases from the repository.
    pub async fn unpack(&self, pack_data: &[u8]) -> Result<DecodedPack, ProtocolError> {
        let mut decoded = Pack::decode(pack_data).map_err(ProtocolError::decode)?;
        loop {
            let missing = decoded.missing_bases();
            if missing.is_empty() {
                break;
            }
            let mut added = false;
            for base in missing {
                match self.repo_access.get_object(&base).await {
                    Ok(object) => {
                        decoded
                            .add_external_base(Entry::from(object))
                            .map_err(ProtocolError::decode)?;
                        added = true;
                    }
                    Err(ProtocolError::Storage(StorageError::NotFound(_))) => {}
                    Err(e) => return Err(e),
                }
            }
            if !added {
                break;
            }
        }
        decoded.ensure_complete().map_err(ProtocolError::decode)?;
        Ok(decoded)
    }

    /// Writes every decoded object; returns how many were stored.
    pub async fn store(&self, decoded: &DecodedPack) -> Result<usize, ProtocolError> {
        for entry in &decoded.entries {
            self.repo_access.put_object(entry.obj_type, &entry.data).await?;
        }
        Ok(decoded.entries.len())
    }
}

fn parse<T: ObjectTrait>(data: &[u8], hash: ObjectHash) -> Result<T, ProtocolError> {
    T::from_bytes(data, hash)
        .map_err(|e| ProtocolError::Pack(format!("failed to parse object {hash}: {e}")))
}
