//! git-smart-server: a Git smart-transport server (protocol v1) speaking HTTP and SSH over
//! pluggable repository storage.
//!
//! Layers
//! - `internal`: Git object model, pack encode/decode, zlib helpers.
//! - `storage`: the `StorageBackend`/`StorageHandle` contract with a local filesystem backend
//!   and a remote backend over a blob store (S3 or in-memory), plus the repository registry.
//! - `protocol`: the transport-agnostic engine: reference advertisement, upload-pack
//!   negotiation and pack generation, receive-pack command application.
//! - `transport`: the session driver binding requests to storage, the axum HTTP surface and
//!   the russh SSH server.
//! - `config`: YAML configuration shared by the binary.
//!
//! Typical Usage
//! - Build a backend, wrap it in a `storage::Registry` and a `transport::SessionDriver`.
//! - Serve `transport::http::create_router(driver, logs)` with axum and/or run a
//!   `transport::ssh::SshServer`.

pub mod config;
pub mod errors;
pub mod hash;
pub mod internal;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use errors::GitError;
pub use protocol::{GitProtocol, ProtocolError, RepositoryAccess, Service, TransportProtocol};
pub use storage::{Registry, StorageBackend, StorageError, StorageHandle};
pub use transport::SessionDriver;
