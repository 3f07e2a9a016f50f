//! Repository storage: the backend contract, the local filesystem and remote key/value
//! implementations, and the registry that resolves repository names.

pub mod backend;
pub mod bootstrap;
pub mod error;
pub mod local;
pub mod lock;
pub mod registry;
pub mod remote;
pub mod types;

pub use backend::{StorageBackend, StorageHandle, resolve_reference};
pub use bootstrap::InitOptions;
pub use error::StorageError;
pub use local::LocalBackend;
pub use registry::Registry;
pub use remote::{
    RemoteBackend, blob::BlobStore, memory::MemoryBlobStore, s3::S3BlobStore,
};
pub use types::{GitObject, Reference, ReferenceTarget, RepoConfig, RepositoryName};
