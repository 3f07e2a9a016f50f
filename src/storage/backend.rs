//! The storage contract: a backend manages repositories, a handle scopes object and reference
//! operations to one repository.

use async_trait::async_trait;

use crate::{
    hash::ObjectHash,
    internal::object::types::ObjectType,
    storage::{
        error::StorageError,
        lock::RefLocks,
        types::{
            GitObject, ObjectIter, Reference, ReferenceIter, ReferenceTarget, RepoConfig,
            RepositoryName,
        },
    },
};

/// Repository lifecycle operations for one storage medium.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name of the medium, used in logs.
    fn kind(&self) -> &'static str;

    async fn exists(&self, name: &RepositoryName) -> Result<bool, StorageError>;

    /// Creates a bare repository with a config, a resolvable `HEAD` and, depending on the
    /// backend's init options, an initial commit. `AlreadyExists` when present.
    async fn create(&self, name: &RepositoryName) -> Result<(), StorageError>;

    /// Removes every object, reference and record of the repository. `NotFound` when absent.
    async fn delete(&self, name: &RepositoryName) -> Result<(), StorageError>;

    /// All repositories, sorted by name.
    async fn list(&self) -> Result<Vec<RepositoryName>, StorageError>;

    async fn open(&self, name: &RepositoryName) -> Result<Box<dyn StorageHandle>, StorageError>;
}

/// Object, reference and metadata access for one repository.
#[async_trait]
pub trait StorageHandle: Send + Sync {
    fn name(&self) -> &RepositoryName;

    /// Stores an object and returns its id. Writing an existing object is a no-op.
    async fn put_object(&self, obj_type: ObjectType, data: &[u8])
    -> Result<ObjectHash, StorageError>;

    async fn get_object(&self, hash: &ObjectHash) -> Result<GitObject, StorageError>;

    /// Reads an object the caller expects to be of kind `expected`. Backends that may hold
    /// objects without a recorded kind report `expected` for them.
    async fn get_object_as(
        &self,
        hash: &ObjectHash,
        _expected: ObjectType,
    ) -> Result<GitObject, StorageError> {
        self.get_object(hash).await
    }

    async fn has_object(&self, hash: &ObjectHash) -> Result<bool, StorageError>;

    async fn object_size(&self, hash: &ObjectHash) -> Result<u64, StorageError> {
        Ok(self.get_object(hash).await?.size())
    }

    async fn delete_object(&self, hash: &ObjectHash) -> Result<(), StorageError>;

    /// Every stored object, optionally restricted to one kind. Each call starts a fresh pass.
    async fn iterate_objects(
        &self,
        type_filter: Option<ObjectType>,
    ) -> Result<ObjectIter, StorageError>;

    /// Reads one reference. Symbolic references are returned as such, never dereferenced.
    async fn get_reference(&self, name: &str) -> Result<Reference, StorageError>;

    async fn set_reference(&self, reference: &Reference) -> Result<(), StorageError>;

    async fn delete_reference(&self, name: &str) -> Result<(), StorageError>;

    /// `HEAD` first when present, then every reference under `refs/` sorted by name.
    async fn iterate_references(&self) -> Result<ReferenceIter, StorageError>;

    /// Writes `new` only if the current value equals `expected_old`; `None` requires the
    /// reference to be absent.
    async fn compare_and_swap_reference(
        &self,
        new: &Reference,
        expected_old: Option<&ReferenceTarget>,
    ) -> Result<(), StorageError>;

    /// Deletes `name` only if its current value equals `expected_old`.
    async fn compare_and_delete_reference(
        &self,
        name: &str,
        expected_old: &ReferenceTarget,
    ) -> Result<(), StorageError>;

    async fn config(&self) -> Result<RepoConfig, StorageError>;

    async fn set_config(&self, config: &RepoConfig) -> Result<(), StorageError>;

    async fn shallow_commits(&self) -> Result<Vec<ObjectHash>, StorageError>;

    /// Replaces the shallow set; an empty slice removes the record.
    async fn set_shallow_commits(&self, commits: &[ObjectHash]) -> Result<(), StorageError>;

    /// Submodule storage.
    async fn module(&self, _name: &str) -> Result<Box<dyn StorageHandle>, StorageError> {
        Err(StorageError::Unsupported("submodule storage"))
    }

    async fn add_alternate(&self, _path: &str) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("alternate object stores"))
    }
}

const MAX_SYMREF_DEPTH: usize = 5;

/// Follows symbolic references to an object id. `Ok(None)` when the chain ends at a missing
/// reference (an unborn branch).
pub async fn resolve_reference(
    handle: &dyn StorageHandle,
    name: &str,
) -> Result<Option<ObjectHash>, StorageError> {
    let mut current = name.to_string();
    for _ in 0..=MAX_SYMREF_DEPTH {
        match handle.get_reference(&current).await {
            Ok(reference) => match reference.target {
                ReferenceTarget::Direct(hash) => return Ok(Some(hash)),
                ReferenceTarget::Symbolic(target) => current = target,
            },
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Err(StorageError::InvalidRequest(format!(
        "symbolic reference chain from {name} is too deep"
    )))
}

async fn current_target(
    handle: &dyn StorageHandle,
    name: &str,
) -> Result<Option<ReferenceTarget>, StorageError> {
    match handle.get_reference(name).await {
        Ok(reference) => Ok(Some(reference.target)),
        Err(StorageError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn describe(target: Option<&ReferenceTarget>) -> String {
    target.map_or_else(|| "<absent>".to_string(), ToString::to_string)
}

/// Lock, read, compare, write. Shared by both backends.
pub(crate) async fn compare_and_swap(
    handle: &dyn StorageHandle,
    locks: &RefLocks,
    new: &Reference,
    expected_old: Option<&ReferenceTarget>,
) -> Result<(), StorageError> {
    let _guard = locks.lock(handle.name(), &new.name).await;
    let current = current_target(handle, &new.name).await?;
    if current.as_ref() != expected_old {
        return Err(StorageError::ReferenceConflict {
            name: new.name.clone(),
            expected: describe(expected_old),
            actual: describe(current.as_ref()),
        });
    }
    handle.set_reference(new).await
}

pub(crate) async fn compare_and_delete(
    handle: &dyn StorageHandle,
    locks: &RefLocks,
    name: &str,
    expected_old: &ReferenceTarget,
) -> Result<(), StorageError> {
    let _guard = locks.lock(handle.name(), name).await;
    let current = current_target(handle, name).await?;
    if current.as_ref() != Some(expected_old) {
        return Err(StorageError::ReferenceConflict {
            name: name.to_string(),
            expected: describe(Some(expected_old)),
            actual: describe(current.as_ref()),
        });
    }
    handle.delete_reference(name).await
}
