//! Filesystem backend. Each repository is a conventional bare Git directory under the root:
//! loose objects, ref files, `config` and `shallow`.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use lru_mem::{HeapSize, LruCache};
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    hash::{ObjectHash, object_header},
    internal::{object::types::ObjectType, zlib},
    storage::{
        backend::{StorageBackend, StorageHandle, compare_and_delete, compare_and_swap},
        bootstrap::{InitOptions, seed},
        error::StorageError,
        lock::RefLocks,
        types::{
            GitObject, HEAD, ObjectIter, Reference, ReferenceIter, ReferenceTarget, RepoConfig,
            RepositoryName, decode_shallow, encode_shallow, validate_reference_name,
        },
    },
};

const LAYOUT_DIRS: [&str; 4] = ["objects/info", "objects/pack", "refs/heads", "refs/tags"];

struct CachedObject {
    obj_type: ObjectType,
    data: Vec<u8>,
}

impl HeapSize for CachedObject {
    fn heap_size(&self) -> usize {
        self.data.capacity()
    }
}

/// Memory-bounded LRU of decoded objects shared by every handle of a backend.
pub struct ObjectCache {
    inner: Mutex<LruCache<String, CachedObject>>,
}

impl ObjectCache {
    pub fn new(max_bytes: usize) -> Self {
        ObjectCache {
            inner: Mutex::new(LruCache::new(max_bytes)),
        }
    }

    fn key(repo: &RepositoryName, hash: &ObjectHash) -> String {
        format!("{repo}/{hash}")
    }

    fn get(&self, repo: &RepositoryName, hash: &ObjectHash) -> Option<GitObject> {
        let mut cache = self.inner.lock().ok()?;
        cache.get(&Self::key(repo, hash)).map(|cached| GitObject {
            hash: *hash,
            obj_type: cached.obj_type,
            data: cached.data.clone(),
        })
    }

    fn insert(&self, repo: &RepositoryName, object: &GitObject) {
        if let Ok(mut cache) = self.inner.lock() {
            // Objects larger than the whole cache are simply not cached.
            let _ = cache.insert(
                Self::key(repo, &object.hash),
                CachedObject {
                    obj_type: object.obj_type,
                    data: object.data.clone(),
                },
            );
        }
    }

    fn remove(&self, repo: &RepositoryName, hash: &ObjectHash) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.remove(&Self::key(repo, hash));
        }
    }

    fn clear(&self) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.clear();
        }
    }
}

/// Writes `data` next to `path` and renames it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::backend(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Parses `packed-refs`: `<hex> <name>` lines, skipping comments and peeled (`^`) lines.
fn parse_packed_refs(content: &str) -> Vec<Reference> {
    content
        .lines()
        .filter(|l| !l.starts_with('#') && !l.starts_with('^'))
        .filter_map(|l| {
            let (hash, name) = l.trim().split_once(' ')?;
            let hash = hash.parse::<ObjectHash>().ok()?;
            Some(Reference::direct(name.trim(), hash))
        })
        .collect()
}

pub struct LocalBackend {
    root: PathBuf,
    cache: Arc<ObjectCache>,
    locks: RefLocks,
    init: InitOptions,
}

impl LocalBackend {
    /// Opens (creating if needed) the root directory.
    pub async fn new(
        root: impl Into<PathBuf>,
        cache_bytes: usize,
        init: InitOptions,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::InvalidRequest(format!(
                    "storage root {} is not a directory",
                    root.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&root).await?;
                info!(root = %root.display(), "created local storage root");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(LocalBackend {
            root,
            cache: Arc::new(ObjectCache::new(cache_bytes)),
            locks: RefLocks::new(),
            init,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, name: &RepositoryName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn handle_at(&self, name: &RepositoryName, dir: PathBuf) -> LocalHandle {
        LocalHandle {
            name: name.clone(),
            dir,
            cache: self.cache.clone(),
            locks: self.locks.clone(),
        }
    }

    /// Sibling path with a hidden, unique name, used for staging and tombstones.
    fn sibling(dir: &Path, tag: &str) -> Result<PathBuf, StorageError> {
        let parent = dir
            .parent()
            .ok_or_else(|| StorageError::backend(format!("{} has no parent", dir.display())))?;
        let file_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(parent.join(format!(".{file_name}.{tag}-{}", Uuid::new_v4())))
    }

    /// Removes the now-empty namespace directories above a deleted repository, stopping at
    /// the root or the first directory that still has entries.
    async fn prune_empty_parents(&self, repo_dir: &Path) {
        let mut current = repo_dir.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            debug!(path = %dir.display(), "removed empty namespace directory");
            current = dir.parent().map(Path::to_path_buf);
        }
    }

    async fn build_repository(
        &self,
        name: &RepositoryName,
        staging: &Path,
    ) -> Result<(), StorageError> {
        for dir in LAYOUT_DIRS {
            fs::create_dir_all(staging.join(dir)).await?;
        }
        let handle = self.handle_at(name, staging.to_path_buf());
        seed(&handle, &self.init).await
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn exists(&self, name: &RepositoryName) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.repo_dir(name).join(HEAD)).await?)
    }

    #[instrument(skip(self), fields(repo = %name))]
    async fn create(&self, name: &RepositoryName) -> Result<(), StorageError> {
        if self.exists(name).await? {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        let dir = self.repo_dir(name);
        let staging = Self::sibling(&dir, "tmp")?;
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(e) = self.build_repository(name, &staging).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&staging, &dir).await {
            let _ = fs::remove_dir_all(&staging).await;
            if self.exists(name).await.unwrap_or(false) {
                return Err(StorageError::AlreadyExists(name.to_string()));
            }
            return Err(e.into());
        }
        info!("repository created");
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %name))]
    async fn delete(&self, name: &RepositoryName) -> Result<(), StorageError> {
        if !self.exists(name).await? {
            return Err(StorageError::not_found(format!("repository {name}")));
        }
        let dir = self.repo_dir(name);
        let tombstone = Self::sibling(&dir, "deleted")?;
        fs::rename(&dir, &tombstone).await?;
        self.cache.clear();
        if let Err(e) = fs::remove_dir_all(&tombstone).await {
            warn!(error = %e, path = %tombstone.display(), "failed to remove deleted repository");
        }
        self.prune_empty_parents(&dir).await;
        info!("repository deleted");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RepositoryName>, StorageError> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                if is_hidden(&file_name) || !entry.file_type().await?.is_dir() {
                    continue;
                }
                let path = entry.path();
                if file_name.ends_with(".git") && fs::try_exists(path.join(HEAD)).await? {
                    let relative = path
                        .strip_prefix(&self.root)
                        .map_err(StorageError::backend)?
                        .to_string_lossy()
                        .replace('\\', "/");
                    match RepositoryName::normalize(&relative) {
                        Ok(name) => found.push(name),
                        Err(e) => debug!(path = %relative, error = %e, "skipping unlisted directory"),
                    }
                } else {
                    pending.push(path);
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
        Ok(Box::new(self.handle_at(name, self.repo_dir(name))))
    }
}

pub struct LocalHandle {
    name: RepositoryName,
    dir: PathBuf,
    cache: Arc<ObjectCache>,
    locks: RefLocks,
}

impl LocalHandle {
    fn object_path(&self, hash: &ObjectHash) -> PathBuf {
        let (dir, file) = hash.fanout();
        self.dir.join("objects").join(dir).join(file)
    }

    fn ref_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_reference_name(name)?;
        Ok(self.dir.join(name))
    }

    async fn packed_refs(&self) -> Result<Vec<Reference>, StorageError> {
        Ok(read_optional(&self.dir.join("packed-refs"))
            .await?
            .map(|data| parse_packed_refs(&String::from_utf8_lossy(&data)))
            .unwrap_or_default())
    }

    fn decode_loose(hash: &ObjectHash, raw: &[u8]) -> Result<GitObject, StorageError> {
        let corrupt = |why: &str| StorageError::backend(format!("corrupt object {hash}: {why}"));
        let inflated = zlib::decompress(raw).map_err(|e| corrupt(&e.to_string()))?;
        let nul = inflated
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| corrupt("missing header"))?;
        let header = std::str::from_utf8(&inflated[..nul]).map_err(|_| corrupt("bad header"))?;
        let (kind, len) = header.split_once(' ').ok_or_else(|| corrupt("bad header"))?;
        let obj_type = ObjectType::from_string(kind)?;
        let len: usize = len.parse().map_err(|_| corrupt("bad length"))?;
        let data = inflated[nul + 1..].to_vec();
        if data.len() != len {
            return Err(corrupt("length mismatch"));
        }
        Ok(GitObject {
            hash: *hash,
            obj_type,
            data,
        })
    }

    /// Removes empty directories between a deleted ref and `refs/<kind>/`.
    async fn prune_ref_dirs(&self, ref_path: &Path) {
        let refs_root = self.dir.join("refs");
        let mut current = ref_path.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            if dir.parent() == Some(refs_root.as_path()) || !dir.starts_with(&refs_root) {
                break;
            }
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }
    }

    async fn walk_refs(&self) -> Result<Vec<Reference>, StorageError> {
        let mut refs = Vec::new();
        let mut pending = vec![self.dir.join("refs")];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                if is_hidden(&file_name) {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = path
                    .strip_prefix(&self.dir)
                    .map_err(StorageError::backend)?
                    .to_string_lossy()
                    .replace('\\', "/");
                let content = fs::read_to_string(&path).await?;
                refs.push(Reference {
                    target: ReferenceTarget::decode(&content)?,
                    name,
                });
            }
        }
        Ok(refs)
    }
}

#[async_trait]
impl StorageHandle for LocalHandle {
    fn name(&self) -> &RepositoryName {
        &self.name
    }

    async fn put_object(
        &self,
        obj_type: ObjectType,
        data: &[u8],
    ) -> Result<ObjectHash, StorageError> {
        let hash = ObjectHash::from_type_and_data(obj_type, data);
        let path = self.object_path(&hash);
        if fs::try_exists(&path).await? {
            return Ok(hash);
        }
        let mut loose = object_header(obj_type, data.len());
        loose.extend_from_slice(data);
        write_atomic(&path, &zlib::compress(&loose)?).await?;
        Ok(hash)
    }

    async fn get_object(&self, hash: &ObjectHash) -> Result<GitObject, StorageError> {
        if let Some(object) = self.cache.get(&self.name, hash) {
            return Ok(object);
        }
        let raw = read_optional(&self.object_path(hash))
            .await?
            .ok_or_else(|| StorageError::not_found(format!("object {hash}")))?;
        let object = Self::decode_loose(hash, &raw)?;
        self.cache.insert(&self.name, &object);
        Ok(object)
    }

    async fn has_object(&self, hash: &ObjectHash) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.object_path(hash)).await?)
    }

    async fn delete_object(&self, hash: &ObjectHash) -> Result<(), StorageError> {
        match fs::remove_file(self.object_path(hash)).await {
            Ok(()) => {
                self.cache.remove(&self.name, hash);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::not_found(format!("object {hash}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn iterate_objects(
        &self,
        type_filter: Option<ObjectType>,
    ) -> Result<ObjectIter, StorageError> {
        let mut objects = Vec::new();
        let mut fanout = fs::read_dir(self.dir.join("objects")).await?;
        while let Some(dir) = fanout.next_entry().await? {
            let prefix = dir.file_name().to_string_lossy().to_string();
            if prefix.len() != 2 || !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let rest = file.file_name().to_string_lossy().to_string();
                let Ok(hash) = format!("{prefix}{rest}").parse::<ObjectHash>() else {
                    continue;
                };
                let object = self.get_object(&hash).await?;
                if type_filter.is_none_or(|t| t == object.obj_type) {
                    objects.push(object);
                }
            }
        }
        objects.sort_by_key(|o| o.hash);
        Ok(objects.into_iter())
    }

    async fn get_reference(&self, name: &str) -> Result<Reference, StorageError> {
        let path = self.ref_path(name)?;
        if let Some(content) = read_optional(&path).await? {
            return Ok(Reference {
                name: name.to_string(),
                target: ReferenceTarget::decode(&String::from_utf8_lossy(&content))?,
            });
        }
        self.packed_refs()
            .await?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| StorageError::not_found(format!("reference {name}")))
    }

    async fn set_reference(&self, reference: &Reference) -> Result<(), StorageError> {
        let path = self.ref_path(&reference.name)?;
        write_atomic(&path, reference.target.encode().as_bytes()).await
    }

    async fn delete_reference(&self, name: &str) -> Result<(), StorageError> {
        let path = self.ref_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_ref_dirs(&path).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.packed_refs().await?.iter().any(|r| r.name == name) {
                    Err(StorageError::Unsupported("deleting packed references"))
                } else {
                    Err(StorageError::not_found(format!("reference {name}")))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn iterate_references(&self) -> Result<ReferenceIter, StorageError> {
        let mut refs = self.walk_refs().await?;
        for packed in self.packed_refs().await? {
            if !refs.iter().any(|r| r.name == packed.name) {
                refs.push(packed);
            }
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(head) = read_optional(&self.dir.join(HEAD)).await? {
            refs.insert(
                0,
                Reference {
                    name: HEAD.to_string(),
                    target: ReferenceTarget::decode(&String::from_utf8_lossy(&head))?,
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
        Ok(read_optional(&self.dir.join("config"))
            .await?
            .map(|data| RepoConfig::new(String::from_utf8_lossy(&data)))
            .unwrap_or_default())
    }

    async fn set_config(&self, config: &RepoConfig) -> Result<(), StorageError> {
        write_atomic(&self.dir.join("config"), config.as_str().as_bytes()).await
    }

    async fn shallow_commits(&self) -> Result<Vec<ObjectHash>, StorageError> {
        match read_optional(&self.dir.join("shallow")).await? {
            Some(data) => decode_shallow(&String::from_utf8_lossy(&data)),
            None => Ok(Vec::new()),
        }
    }

    async fn set_shallow_commits(&self, commits: &[ObjectHash]) -> Result<(), StorageError> {
        let path = self.dir.join("shallow");
        if commits.is_empty() {
            return match fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        write_atomic(&path, encode_shallow(commits).as_bytes()).await
    }
}
