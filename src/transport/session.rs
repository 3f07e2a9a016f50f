//! Transport session driver: binds one HTTP request or one SSH channel to a storage handle and
//! runs the matching engine call. It holds no state across calls.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

use crate::{
    hash::ObjectHash,
    internal::object::types::ObjectType,
    protocol::{
        GitProtocol, ProtocolError, ProtocolStream, RepositoryAccess, Service, TransportProtocol,
    },
    storage::{
        GitObject, Reference, ReferenceTarget, Registry, StorageError, StorageHandle,
        resolve_reference,
    },
};

/// [`RepositoryAccess`] over one repository's storage handle.
#[derive(Clone)]
pub struct StorageAccess {
    handle: Arc<dyn StorageHandle>,
}

impl StorageAccess {
    pub fn new(handle: Box<dyn StorageHandle>) -> Self {
        Self {
            handle: Arc::from(handle),
        }
    }
}

#[async_trait]
impl RepositoryAccess for StorageAccess {
    async fn get_repository_refs(&self) -> Result<Vec<Reference>, ProtocolError> {
        Ok(self.handle.iterate_references().await?.collect())
    }

    async fn resolve(&self, name: &str) -> Result<Option<ObjectHash>, ProtocolError> {
        Ok(resolve_reference(self.handle.as_ref(), name).await?)
    }

    async fn has_object(&self, hash: &ObjectHash) -> Result<bool, ProtocolError> {
        Ok(self.handle.has_object(hash).await?)
    }

    async fn get_object(&self, hash: &ObjectHash) -> Result<GitObject, ProtocolError> {
        Ok(self.handle.get_object(hash).await?)
    }

    async fn get_object_as(
        &self,
        hash: &ObjectHash,
        expected: ObjectType,
    ) -> Result<GitObject, ProtocolError> {
        Ok(self.handle.get_object_as(hash, expected).await?)
    }

    async fn put_object(
        &self,
        obj_type: ObjectType,
        data: &[u8],
    ) -> Result<ObjectHash, ProtocolError> {
        Ok(self.handle.put_object(obj_type, data).await?)
    }

    async fn update_reference(
        &self,
        name: &str,
        old: Option<ObjectHash>,
        new: Option<ObjectHash>,
    ) -> Result<(), ProtocolError> {
        let expected = old.map(ReferenceTarget::Direct);
        match new {
            Some(hash) => {
                self.handle
                    .compare_and_swap_reference(&Reference::direct(name, hash), expected.as_ref())
                    .await?
            }
            None => match expected {
                Some(expected) => {
                    self.handle
                        .compare_and_delete_reference(name, &expected)
                        .await?
                }
                None => {
                    return Err(StorageError::InvalidRequest(format!(
                        "delete of {name} without an old value"
                    ))
                    .into());
                }
            },
        }
        Ok(())
    }
}

/// Turns transport requests into engine calls against registry-resolved repositories.
#[derive(Clone)]
pub struct SessionDriver {
    registry: Registry,
}

impl SessionDriver {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Engine bound to `repo`. Receive-pack over SSH creates missing repositories.
    async fn engine(
        &self,
        repo: &str,
        binding: TransportProtocol,
        create_missing: bool,
    ) -> Result<GitProtocol<StorageAccess>, ProtocolError> {
        let handle = if create_missing {
            self.registry.open_or_create(repo).await?
        } else {
            self.registry.open(repo).await?
        };
        Ok(GitProtocol::new(StorageAccess::new(handle), binding))
    }

    /// Reference advertisement; the HTTP binding adds the `# service=` preamble.
    #[instrument(skip(self))]
    pub async fn advertise(
        &self,
        repo: &str,
        service: Service,
        binding: TransportProtocol,
    ) -> Result<Bytes, ProtocolError> {
        let engine = self.engine(repo, binding, false).await?;
        engine.info_refs(service).await
    }

    /// Stateless upload-pack (HTTP). Requests without wants produce an empty stream.
    #[instrument(skip(self, request), fields(len = request.len()))]
    pub async fn upload_pack(
        &self,
        repo: &str,
        request: Bytes,
    ) -> Result<ProtocolStream, ProtocolError> {
        let mut engine = self.engine(repo, TransportProtocol::Http, false).await?;
        engine.upload_pack(request).await
    }

    /// Stateless receive-pack (HTTP). Per-reference failures are in the report, not errors.
    #[instrument(skip(self, request))]
    pub async fn receive_pack(
        &self,
        repo: &str,
        request: ProtocolStream,
    ) -> Result<Bytes, ProtocolError> {
        let mut engine = self.engine(repo, TransportProtocol::Http, false).await?;
        engine.receive_pack(request).await
    }

    /// The SSH binding: unprefixed advertisement followed by the stateful exchange.
    #[instrument(skip(self, reader, writer))]
    pub async fn serve_ssh<Rd, W>(
        &self,
        service: Service,
        repo: &str,
        reader: &mut Rd,
        writer: &mut W,
    ) -> Result<(), ProtocolError>
    where
        Rd: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let create_missing = service == Service::ReceivePack;
        let mut engine = self
            .engine(repo, TransportProtocol::Ssh, create_missing)
            .await?;
        engine.serve(service, reader, writer).await?;
        debug!("ssh exchange finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::{Bytes, BytesMut};
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        internal::pack::Pack,
        protocol::utils::{PktLine, add_flush, add_pkt_line_string, read_pkt_line},
        storage::{
            InitOptions, MemoryBlobStore, RemoteBackend,
            remote::blob::{BlobStore, Metadata},
            types::HEAD,
        },
    };

    fn driver(initial_commit: bool) -> SessionDriver {
        let init = InitOptions {
            initial_commit,
            ..InitOptions::default()
        };
        let backend = RemoteBackend::new(MemoryBlobStore::new(), init);
        SessionDriver::new(Registry::new(Arc::new(backend)))
    }

    async fn head_of(driver: &SessionDriver, repo: &str) -> Option<ObjectHash> {
        let access = StorageAccess::new(driver.registry().open(repo).await.unwrap());
        access.resolve(HEAD).await.unwrap()
    }

    /// Runs one SSH exchange over an in-memory duplex pipe and returns everything the
    /// server wrote.
    async fn ssh_exchange(
        driver: &SessionDriver,
        service: Service,
        repo: &str,
        request: Bytes,
    ) -> (Result<(), ProtocolError>, Bytes) {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let driver = driver.clone();
        let repo = repo.to_string();
        let task = tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            driver
                .serve_ssh(service, &repo, &mut reader, &mut writer)
                .await
        });
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();
        let result = task.await.unwrap();
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        (result, Bytes::from(output))
    }

    fn count_pkt_lines(mut data: Bytes) -> (usize, Bytes) {
        let mut count = 0;
        while let Ok(Some(line)) = read_pkt_line(&mut data) {
            count += 1;
            if line == PktLine::Flush {
                break;
            }
        }
        (count, data)
    }

    #[tokio::test]
    async fn test_advertise_bindings() {
        let driver = driver(true);
        driver.registry().create("demo").await.unwrap();

        let http = driver
            .advertise("demo", Service::UploadPack, TransportProtocol::Http)
            .await
            .unwrap();
        assert!(http.starts_with(b"001e# service=git-upload-pack\n0000"));

        let ssh = driver
            .advertise("/demo.git/", Service::ReceivePack, TransportProtocol::Ssh)
            .await
            .unwrap();
        let head = head_of(&driver, "demo").await.unwrap();
        assert!(ssh[4..].starts_with(format!("{head} HEAD\0report-status").as_bytes()));
        assert!(!String::from_utf8_lossy(&ssh).contains("# service="));

        let missing = driver
            .advertise("nope", Service::UploadPack, TransportProtocol::Http)
            .await;
        assert!(matches!(missing, Err(ProtocolError::Storage(StorageError::NotFound(_)))));
    }

    #[tokio::test]
    async fn test_empty_repository_fetch_is_noop() {
        let driver = driver(false);
        driver.registry().create("empty").await.unwrap();

        let advert = driver
            .advertise("empty", Service::UploadPack, TransportProtocol::Http)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&advert).contains("capabilities^{}"));

        for body in [Bytes::new(), Bytes::from_static(b"0000")] {
            let mut stream = driver.upload_pack("empty", body).await.unwrap();
            assert!(stream.next().await.is_none());
        }

        let (result, output) =
            ssh_exchange(&driver, Service::UploadPack, "empty", Bytes::new()).await;
        result.unwrap();
        let (lines, rest) = count_pkt_lines(output);
        assert_eq!(lines, 2);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_ssh_clone() {
        let driver = driver(true);
        driver.registry().create("team/project").await.unwrap();
        let head = head_of(&driver, "team/project.git").await.unwrap();

        let mut request = BytesMut::new();
        add_pkt_line_string(&mut request, format!("want {head} side-band-64k\n"));
        add_flush(&mut request);
        add_pkt_line_string(&mut request, "done\n".to_string());
        let (result, output) = ssh_exchange(
            &driver,
            Service::UploadPack,
            "/team/project.git",
            request.freeze(),
        )
        .await;
        result.unwrap();

        // HEAD, main, flush, then NAK.
        let (lines, mut rest) = count_pkt_lines(output);
        assert_eq!(lines, 3);
        assert_eq!(
            read_pkt_line(&mut rest).unwrap(),
            Some(PktLine::Data(Bytes::from_static(b"NAK\n")))
        );
        let mut pack = Vec::new();
        while let Some(PktLine::Data(frame)) = read_pkt_line(&mut rest).unwrap() {
            assert_eq!(frame[0], 1);
            pack.extend_from_slice(&frame[1..]);
        }
        // Blob, tree and commit of the initial content.
        assert_eq!(Pack::decode(&pack).unwrap().entries.len(), 3);
    }

    #[tokio::test]
    async fn test_ssh_push_creates_missing_repository() {
        let driver = driver(true);
        assert!(!driver.registry().exists("fresh").await.unwrap());

        // Nothing to push: the client only sends a flush.
        let (result, _) = ssh_exchange(
            &driver,
            Service::ReceivePack,
            "fresh",
            Bytes::from_static(b"0000"),
        )
        .await;
        result.unwrap();
        assert!(driver.registry().exists("fresh.git").await.unwrap());

        let (result, _) =
            ssh_exchange(&driver, Service::UploadPack, "absent", Bytes::new()).await;
        assert!(matches!(
            result,
            Err(ProtocolError::Storage(StorageError::NotFound(_)))
        ));
        assert!(!driver.registry().exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_http_push_updates_and_deletes() {
        let driver = driver(true);
        driver.registry().create("demo").await.unwrap();
        let head = head_of(&driver, "demo").await.unwrap();
        let zero = ObjectHash::zero_str();

        let mut body = BytesMut::new();
        add_pkt_line_string(
            &mut body,
            format!("{zero} {head} refs/heads/topic\0report-status\n"),
        );
        add_flush(&mut body);
        let request: ProtocolStream =
            Box::pin(futures::stream::iter(vec![Ok::<Bytes, ProtocolError>(body.freeze())]));
        let report = driver.receive_pack("demo", request).await.unwrap();
        assert!(String::from_utf8_lossy(&report).contains("ok refs/heads/topic\n"));

        let mut body = BytesMut::new();
        add_pkt_line_string(
            &mut body,
            format!("{head} {zero} refs/heads/topic\0report-status delete-refs\n"),
        );
        add_flush(&mut body);
        let request: ProtocolStream =
            Box::pin(futures::stream::iter(vec![Ok::<Bytes, ProtocolError>(body.freeze())]));
        let report = driver.receive_pack("demo", request).await.unwrap();
        assert!(String::from_utf8_lossy(&report).contains("ok refs/heads/topic\n"));

        let access = StorageAccess::new(driver.registry().open("demo").await.unwrap());
        assert_eq!(access.resolve("refs/heads/topic").await.unwrap(), None);
        assert_eq!(access.resolve(HEAD).await.unwrap(), Some(head));
    }

    #[tokio::test]
    async fn test_typed_reads_of_untyped_objects() {
        let store = Arc::new(MemoryBlobStore::new());
        let backend = RemoteBackend::from_arc(store.clone(), InitOptions::default());
        let driver = SessionDriver::new(Registry::new(Arc::new(backend)));
        driver.registry().create("demo").await.unwrap();

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

        let access = StorageAccess::new(driver.registry().open("demo").await.unwrap());
        let tree = access.get_tree(&hash).await.unwrap();
        assert_eq!(tree.tree_items.len(), 1);
        assert_eq!(tree.tree_items[0].name, "a");
        assert_eq!(
            access.get_object(&hash).await.unwrap().obj_type,
            ObjectType::Blob
        );
    }
}
