//! Core Git protocol implementation
//!
//! This module provides the main `GitProtocol` struct and the `RepositoryAccess` trait the
//! engine reads and writes repository data through.
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    hash::ObjectHash,
    internal::object::{
        ObjectTrait, commit::Commit, tag::Tag, tree::Tree, types::ObjectType,
    },
    protocol::{
        smart::SmartProtocol,
        types::{ProtocolError, ProtocolStream, RefCommand, Service, TransportProtocol},
    },
    storage::{GitObject, Reference},
};

/// Repository access trait for storage operations
///
/// This trait only handles storage-level operations, not Git protocol details.
#[async_trait]
pub trait RepositoryAccess: Send + Sync + Clone + 'static {
    /// `HEAD` first when present, then every reference sorted by name.
    async fn get_repository_refs(&self) -> Result<Vec<Reference>, ProtocolError>;

    /// Follows symbolic references to an object id; `None` for an unborn branch.
    async fn resolve(&self, name: &str) -> Result<Option<ObjectHash>, ProtocolError>;

    async fn has_object(&self, hash: &ObjectHash) -> Result<bool, ProtocolError>;

    async fn get_object(&self, hash: &ObjectHash) -> Result<GitObject, ProtocolError>;

    async fn put_object(&self, obj_type: ObjectType, data: &[u8])
    -> Result<ObjectHash, ProtocolError>;

    /// Moves `name` from `old` to `new` atomically; `None` means absent on either side.
    async fn update_reference(
        &self,
        name: &str,
        old: Option<ObjectHash>,
        new: Option<ObjectHash>,
    ) -> Result<(), ProtocolError>;

    /// Runs after a push has been applied, with the final status of every command.
    async fn post_receive_hook(&self, _commands: &[RefCommand]) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Reads an object the caller expects to be of kind `expected`. Storage that may hold
    /// objects without a recorded kind reports `expected` for them.
    async fn get_object_as(
        &self,
        hash: &ObjectHash,
        _expected: ObjectType,
    ) -> Result<GitObject, ProtocolError> {
        self.get_object(hash).await
    }

    async fn get_typed(
        &self,
        hash: &ObjectHash,
        expected: ObjectType,
    ) -> Result<GitObject, ProtocolError> {
        let object = self.get_object_as(hash, expected).await?;
        if object.obj_type != expected {
            return Err(ProtocolError::invalid_request(format!(
                "object {hash} is a {}, expected {expected}",
                object.obj_type
            )));
        }
        Ok(object)
    }

    /// Get commit data by hash
    async fn get_commit(&self, hash: &ObjectHash) -> Result<Commit, ProtocolError> {
        let object = self.get_typed(hash, ObjectType::Commit).await?;
        Commit::from_bytes(&object.data, *hash)
            .map_err(|e| ProtocolError::Pack(format!("failed to parse commit {hash}: {e}")))
    }

    /// Get tree data by hash
    async fn get_tree(&self, hash: &ObjectHash) -> Result<Tree, ProtocolError> {
        let object = self.get_typed(hash, ObjectType::Tree).await?;
        Tree::from_bytes(&object.data, *hash)
            .map_err(|e| ProtocolError::Pack(format!("failed to parse tree {hash}: {e}")))
    }

    /// Get annotated tag data by hash
    async fn get_tag(&self, hash: &ObjectHash) -> Result<Tag, ProtocolError> {
        let object = self.get_typed(hash, ObjectType::Tag).await?;
        Tag::from_bytes(&object.data, *hash)
            .map_err(|e| ProtocolError::Pack(format!("failed to parse tag {hash}: {e}")))
    }
}

/// Transport-agnostic Git smart protocol handler
///
/// One instance serves one protocol exchange. It uses `SmartProtocol` internally to handle
/// the wire details.
pub struct GitProtocol<R: RepositoryAccess> {
    smart_protocol: SmartProtocol<R>,
}

impl<R: RepositoryAccess> GitProtocol<R> {
    pub fn new(repo_access: R, transport: TransportProtocol) -> Self {
        Self {
            smart_protocol: SmartProtocol::new(transport, repo_access),
        }
    }

    /// Reference advertisement; over HTTP it carries the `# service=` preamble.
    pub async fn info_refs(&self, service: Service) -> Result<Bytes, ProtocolError> {
        let bytes = self.smart_protocol.git_info_refs(service).await?;
        Ok(bytes.freeze())
    }

    /// Stateless upload-pack (HTTP). An empty stream when the request wants nothing.
    pub async fn upload_pack(&mut self, request_data: Bytes) -> Result<ProtocolStream, ProtocolError> {
        self.smart_protocol.git_upload_pack(request_data).await
    }

    /// Stateless receive-pack (HTTP): commands and pack in one body, report as the result.
    pub async fn receive_pack(
        &mut self,
        request_stream: ProtocolStream,
    ) -> Result<Bytes, ProtocolError> {
        self.smart_protocol
            .git_receive_pack_stream(request_stream)
            .await
    }

    /// Full connection-oriented exchange for one service, advertisement included.
    pub async fn serve<Rd, W>(
        &mut self,
        service: Service,
        reader: &mut Rd,
        writer: &mut W,
    ) -> Result<(), ProtocolError>
    where
        Rd: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        match service {
            Service::UploadPack => {
                self.smart_protocol
                    .serve_upload_pack(reader, writer)
                    .await
            }
            Service::ReceivePack => {
                self.smart_protocol
                    .serve_receive_pack(reader, writer)
                    .await
            }
        }
    }
}
