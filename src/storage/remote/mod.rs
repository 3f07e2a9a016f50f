//! Key/value backend. Every repository lives under `repositories/<name>/` in a flat blob store;
//! objects carry their kind in the `git-type` metadata entry.

pub mod blob;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, instrument};

use crate::{
    hash::ObjectHash,
    internal::object::types::ObjectType,
    storage::{
        backend::{StorageBackend, StorageHandle, compare_and_delete, compare_and_swap},
        bootstrap::{InitOptions, seed_content},
        error::StorageError,
        lock::RefLocks,
        remote::blob::{BlobStore, Metadata, delete_all, list_all},
        types::{
            GitObject, HEAD, ObjectIter, Reference, ReferenceIter, ReferenceTarget, RepoConfig,
            RepositoryName, decode_shallow, encode_shallow, validate_reference_name,
        },
    },
};

pub const ROOT_PREFIX: &str = "repositories/";
pub const TYPE_METADATA: &str = "git-type";
const KEEP_MARKER: &str = "objects/.keep";

pub struct RemoteBackend<S: BlobStore> {
    store: Arc<S>,
    locks: RefLocks,
    init: InitOptions,
}

impl<S: BlobStore> RemoteBackend<S> {
    pub fn new(store: S, init: InitOptions) -> Self {
        Self::from_arc(Arc::new(store), init)
    }

    pub fn from_arc(store: Arc<S>, init: InitOptions) -> Self {
        RemoteBackend {
            store,
            locks: RefLocks::new(),
            init,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn prefix(name: &RepositoryName) -> String {
        format!("{ROOT_PREFIX}{name}/")
    }

    fn handle(&self, name: &RepositoryName) -> RemoteHandle<S> {
        RemoteHandle {
            name: name.clone(),
            prefix: Self::prefix(name),
            store: self.store.clone(),
            locks: self.locks.clone(),
        }
    }
}

#[async_trait]
impl<S: BlobStore> StorageBackend for RemoteBackend<S> {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn exists(&self, name: &RepositoryName) -> Result<bool, StorageError> {
        let key = format!("{}{HEAD}", Self::prefix(name));
        Ok(self.store.head(&key).await?.is_some())
    }

    /// `HEAD` is written last, so the repository only exists once it is complete.
    #[instrument(skip(self), fields(repo = %name))]
    async fn create(&self, name: &RepositoryName) -> Result<(), StorageError> {
        if self.exists(name).await? {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        let handle = self.handle(name);
        handle.set_config(&RepoConfig::default()).await?;
        self.store
            .put(&handle.key(KEEP_MARKER), Bytes::new(), Metadata::new())
            .await?;
        seed_content(&handle, &self.init).await?;
        info!("repository created");
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %name))]
    async fn delete(&self, name: &RepositoryName) -> Result<(), StorageError> {
        if !self.exists(name).await? {
            return Err(StorageError::not_found(format!("repository {name}")));
        }
        let prefix = Self::prefix(name);
        self.store.delete(&format!("{prefix}{HEAD}")).await?;
        let keys = list_all(self.store.as_ref(), &prefix).await?;
        delete_all(self.store.as_ref(), &keys).await?;
        info!(keys = keys.len() + 1, "repository deleted");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RepositoryName>, StorageError> {
        let mut found = Vec::new();
        let mut pending = vec![ROOT_PREFIX.to_string()];
        while let Some(prefix) = pending.pop() {
            let mut continuation = None;
            loop {
                let page = self
                    .store
                    .list_page(&prefix, Some("/"), continuation)
                    .await?;
                for group in page.common_prefixes {
                    let is_repo = group.ends_with(".git/")
                        && self.store.head(&format!("{group}{HEAD}")).await?.is_some();
                    if is_repo {
                        let raw = group.trim_start_matches(ROOT_PREFIX);
                        found.push(RepositoryName::normalize(raw)?);
                    } else {
                        pending.push(group);
                    }
                }
                match page.next {
                    Some(token) => continuation = Some(token),
                    None => break,
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn open(&self, name: &RepositoryName) -> Result<Box<dyn StorageHandle>, StorageError> {
        if !self.exists(name).await? {
            return Err(StorageError::not_found(format!("repository {name}")));
        }
        Ok(Box::new(self.handle(name)))
    }
}

pub struct RemoteHandle<S: BlobStore> {
    name: RepositoryName,
    prefix: String,
    store: Arc<S>,
    locks: RefLocks,
}

impl<S: BlobStore> RemoteHandle<S> {
    fn key(&self, relative: &str) -> String {
        format!("{}{relative}", self.prefix)
    }

    fn object_key(&self, hash: &ObjectHash) -> String {
        let (dir, file) = hash.fanout();
        self.key(&format!("objects/{dir}/{file}"))
    }

    fn ref_key(&self, name: &str) -> Result<String, StorageError> {
        validate_reference_name(name)?;
        Ok(self.key(name))
    }

    async fn read_reference_key(&self, key: &str) -> Result<Option<ReferenceTarget>, StorageError> {
        match self.store.get(key).await? {
            Some(blob) => Ok(Some(ReferenceTarget::decode(&String::from_utf8_lossy(
                &blob.data,
            ))?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: BlobStore> StorageHandle for RemoteHandle<S> {
    fn name(&self) -> &RepositoryName {
        &self.name
    }

    async fn put_object(
        &self,
        obj_type: ObjectType,
        data: &[u8],
    ) -> Result<ObjectHash, StorageError> {
        let hash = ObjectHash::from_type_and_data(obj_type, data);
        let key = self.object_key(&hash);
        if self.store.head(&key).await?.is_some() {
            return Ok(hash);
        }
        let metadata = Metadata::from([(TYPE_METADATA.to_string(), obj_type.to_string())]);
        self.store
            .put(&key, Bytes::copy_from_slice(data), metadata)
            .await?;
        Ok(hash)
    }

    async fn get_object(&self, hash: &ObjectHash) -> Result<GitObject, StorageError> {
        self.get_object_as(hash, ObjectType::Blob).await
    }

    /// Objects written without a `git-type` entry take their kind from `fallback`.
    async fn get_object_as(
        &self,
        hash: &ObjectHash,
        fallback: ObjectType,
    ) -> Result<GitObject, StorageError> {
        let blob = self
            .store
            .get(&self.object_key(hash))
            .await?
            .ok_or_else(|| StorageError::not_found(format!("object {hash}")))?;
        let obj_type = match blob.metadata.get(TYPE_METADATA) {
            Some(kind) => ObjectType::from_string(kind)?,
            None => fallback,
        };
        Ok(GitObject {
            hash: *hash,
            obj_type,
            data: blob.data.to_vec(),
        })
    }

    async fn has_object(&self, hash: &ObjectHash) -> Result<bool, StorageError> {
        Ok(self.store.head(&self.object_key(hash)).await?.is_some())
    }

    async fn delete_object(&self, hash: &ObjectHash) -> Result<(), StorageError> {
        let key = self.object_key(hash);
        if self.store.head(&key).await?.is_none() {
            return Err(StorageError::not_found(format!("object {hash}")));
        }
        self.store.delete(&key).await
    }

    async fn iterate_objects(
        &self,
        type_filter: Option<ObjectType>,
    ) -> Result<ObjectIter, StorageError> {
        let objects_prefix = self.key("objects/");
        let mut objects = Vec::new();
        for key in list_all(self.store.as_ref(), &objects_prefix).await? {
            let hex = key[objects_prefix.len()..].replace('/', "");
            let Ok(hash) = hex.parse::<ObjectHash>() else {
                continue;
            };
            let fallback = type_filter.unwrap_or(ObjectType::Blob);
            let object = self.get_object_as(&hash, fallback).await?;
            if type_filter.is_none_or(|t| t == object.obj_type) {
                objects.push(object);
            }
        }
        Ok(objects.into_iter())
    }

    async fn get_reference(&self, name: &str) -> Result<Reference, StorageError> {
        let key = self.ref_key(name)?;
        let target = self
            .read_reference_key(&key)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("reference {name}")))?;
        Ok(Reference {
            name: name.to_string(),
            target,
        })
    }

    async fn set_reference(&self, reference: &Reference) -> Result<(), StorageError> {
        let key = self.ref_key(&reference.name)?;
        self.store
            .put(&key, Bytes::from(reference.target.encode()), Metadata::new())
            .await
    }

    async fn delete_reference(&self, name: &str) -> Result<(), StorageError> {
        let key = self.ref_key(name)?;
        if self.store.head(&key).await?.is_none() {
            return Err(StorageError::not_found(format!("reference {name}")));
        }
        self.store.delete(&key).await
    }

    async fn iterate_references(&self) -> Result<ReferenceIter, StorageError> {
        let mut refs = Vec::new();
        for key in list_all(self.store.as_ref(), &self.key("refs/")).await? {
            if let Some(target) = self.read_reference_key(&key).await? {
                refs.push(Reference {
                    name: key[self.prefix.len()..].to_string(),
                    target,
                });
            }
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(target) = self.read_reference_key(&self.key(HEAD)).await? {
            refs.insert(
                0,
                Reference {
                    name: HEAD.to_string(),
                    target,
                },
            );
        }
        Ok(refs.into_iter())
    }

    async fn compare_and_swap_reference(
        &self,
        new: &Reference,
        expected_old: Option<&ReferenceTarget>,
    ) -> Result<(), StorageError> {
        compare_and_swap(self, &self.locks, new, expected_old).await
    }

    async fn compare_and_delete_reference(
        &self,
        name: &str,
        expected_old: &ReferenceTarget,
    ) -> Result<(), StorageError> {
        compare_and_delete(self, &self.locks, name, expected_old).await
    }

    async fn config(&self) -> Result<RepoConfig, StorageError> {
        Ok(self
            .store
            .get(&self.key("config"))
            .await?
            .map(|blob| RepoConfig::new(String::from_utf8_lossy(&blob.data)))
            .unwrap_or_default())
    }

    async fn set_config(&self, config: &RepoConfig) -> Result<(), StorageError> {
        self.store
            .put(
                &self.key("config"),
                Bytes::copy_from_slice(config.as_str().as_bytes()),
                Metadata::new(),
            )
            .await
    }

    async fn shallow_commits(&self) -> Result<Vec<ObjectHash>, StorageError> {
        match self.store.get(&self.key("shallow")).await? {
            Some(blob) => decode_shallow(&String::from_utf8_lossy(&blob.data)),
            None => Ok(Vec::new()),
        }
    }

    async fn set_shallow_commits(&self, commits: &[ObjectHash]) -> Result<(), StorageError> {
        let key = self.key("shallow");
        if commits.is_empty() {
            return self.store.delete(&key).await;
        }
        self.store
            .put(&key, Bytes::from(encode_shallow(commits)), Metadata::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::{RemoteBackend, TYPE_METADATA};
    use crate::{
        hash::ObjectHash,
        internal::object::types::ObjectType,
        storage::{
            backend::{StorageBackend, StorageHandle, resolve_reference},
            bootstrap::InitOptions,
            error::StorageError,
            remote::{
                blob::{BlobStore, Metadata},
                memory::MemoryBlobStore,
            },
            types::{Reference, ReferenceTarget, RepositoryName},
        },
    };

    fn backend(page_size: usize) -> (Arc<MemoryBlobStore>, RemoteBackend<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::with_page_size(page_size));
        let backend = RemoteBackend::from_arc(store.clone(), InitOptions::default());
        (store, backend)
    }

    fn name(raw: &str) -> RepositoryName {
        RepositoryName::normalize(raw).unwrap()
    }

    #[tokio::test]
    async fn test_create_key_layout() {
        let (store, backend) = backend(1000);
        backend.create(&name("demo")).await.unwrap();

        let keys = store.keys().await;
        for expected in [
            "repositories/demo.git/HEAD",
            "repositories/demo.git/config",
            "repositories/demo.git/objects/.keep",
            "repositories/demo.git/refs/heads/main",
        ] {
            assert!(keys.iter().any(|k| k == expected), "{expected} missing");
        }
        // blob, tree, commit
        let object_keys = keys
            .iter()
            .filter(|k| k.contains("/objects/") && !k.ends_with(".keep"))
            .count();
        assert_eq!(object_keys, 3);

        let head = store.get("repositories/demo.git/HEAD").await.unwrap().unwrap();
        assert_eq!(head.data, Bytes::from_static(b"ref: refs/heads/main\n"));

        let handle = backend.open(&name("demo.git")).await.unwrap();
        let commit = resolve_reference(handle.as_ref(), "HEAD").await.unwrap().unwrap();
        let (dir, file) = commit.fanout();
        let stored = store
            .get(&format!("repositories/demo.git/objects/{dir}/{file}"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.metadata.get(TYPE_METADATA).unwrap(), "commit");
        assert_eq!(
            handle.get_object(&commit).await.unwrap().obj_type,
            ObjectType::Commit
        );
    }

    /// Objects written without `git-type` fall back to the caller's kind, or blob.
    #[tokio::test]
    async fn test_missing_type_metadata_fallback() {
        let (store, backend) = backend(1000);
        backend.create(&name("demo")).await.unwrap();
        let handle = backend.handle(&name("demo"));

        let data = b"100644 a\0aaaaaaaaaaaaaaaaaaaa";
        let hash = ObjectHash::from_type_and_data(ObjectType::Tree, data);
        let (dir, file) = hash.fanout();
        store
            .put(
                &format!("repositories/demo.git/objects/{dir}/{file}"),
                Bytes::from_static(data),
                Metadata::new(),
            )
            .await
            .unwrap();

        assert_eq!(handle.get_object(&hash).await.unwrap().obj_type, ObjectType::Blob);
        let tree = handle.get_object_as(&hash, ObjectType::Tree).await.unwrap();
        assert_eq!(tree.obj_type, ObjectType::Tree);
        assert_eq!(tree.data, data);

        // Typed iteration reports untyped objects under the requested kind.
        let trees: Vec<_> = handle.iterate_objects(Some(ObjectType::Tree)).await.unwrap().collect();
        assert!(trees.iter().any(|o| o.hash == hash && o.obj_type == ObjectType::Tree));
        let commits: Vec<_> = handle
            .iterate_objects(Some(ObjectType::Commit))
            .await
            .unwrap()
            .collect();
        assert!(commits.iter().any(|o| o.hash == hash));
    }

    #[tokio::test]
    async fn test_content_addressing_and_cas() {
        let (_, backend) = backend(1000);
        backend.create(&name("demo")).await.unwrap();
        let handle = backend.open(&name("demo")).await.unwrap();

        let a = handle.put_object(ObjectType::Blob, b"hello\n").await.unwrap();
        assert_eq!(a, handle.put_object(ObjectType::Blob, b"hello\n").await.unwrap());
        assert_eq!(handle.object_size(&a).await.unwrap(), 6);
        let b = handle.put_object(ObjectType::Blob, b"other").await.unwrap();

        let topic = Reference::direct("refs/heads/topic", a);
        handle.compare_and_swap_reference(&topic, None).await.unwrap();
        let err = handle
            .compare_and_swap_reference(&Reference::direct("refs/heads/topic", b), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ReferenceConflict { .. }));
        assert_eq!(handle.get_reference("refs/heads/topic").await.unwrap().hash(), Some(a));

        handle
            .compare_and_swap_reference(
                &Reference::direct("refs/heads/topic", b),
                Some(&ReferenceTarget::Direct(a)),
            )
            .await
            .unwrap();

        let wrong = ReferenceTarget::Symbolic("refs/heads/nope".to_string());
        assert!(
            handle
                .compare_and_swap_reference(&Reference::symbolic("HEAD", "refs/heads/topic"), Some(&wrong))
                .await
                .is_err()
        );

        let names: Vec<String> = handle
            .iterate_references()
            .await
            .unwrap()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["HEAD", "refs/heads/main", "refs/heads/topic"]);

        handle.delete_object(&b).await.unwrap();
        assert!(!handle.has_object(&b).await.unwrap());
        assert!(handle.delete_reference("refs/heads/none").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_removes_every_key() {
        let (store, backend) = backend(2);
        backend.create(&name("demo")).await.unwrap();
        backend.create(&name("keep")).await.unwrap();
        let handle = backend.open(&name("demo")).await.unwrap();
        for i in 0..10u8 {
            handle.put_object(ObjectType::Blob, &[i]).await.unwrap();
        }
        handle
            .set_shallow_commits(&[ObjectHash::from_type_and_data(ObjectType::Commit, b"c")])
            .await
            .unwrap();

        backend.delete(&name("demo")).await.unwrap();
        assert!(!backend.exists(&name("demo")).await.unwrap());
        assert!(
            store
                .keys()
                .await
                .iter()
                .all(|k| !k.starts_with("repositories/demo.git/"))
        );
        assert!(backend.exists(&name("keep")).await.unwrap());
        assert!(backend.delete(&name("demo")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_paginates_and_descends() {
        let (_, backend) = backend(1);
        for repo in ["b", "a", "team/c", "team/deep/d"] {
            backend.create(&name(repo)).await.unwrap();
        }
        let names: Vec<String> = backend
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            names,
            vec!["a.git", "b.git", "team/c.git", "team/deep/d.git"]
        );
    }

    #[tokio::test]
    async fn test_iterate_objects_filter() {
        let (_, backend) = backend(2);
        backend.create(&name("demo")).await.unwrap();
        let handle = backend.open(&name("demo")).await.unwrap();
        assert_eq!(handle.iterate_objects(None).await.unwrap().count(), 3);
        assert_eq!(
            handle
                .iterate_objects(Some(ObjectType::Tree))
                .await
                .unwrap()
                .count(),
            1
        );
    }
}
