//! S3 (and S3-compatible) implementation of [`BlobStore`].

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    config::Credentials,
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
};
use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::{
    config::S3Config,
    storage::{
        error::StorageError,
        remote::blob::{BlobStore, DELETE_BATCH, ListPage, Metadata, StoredBlob},
    },
};

fn s3_error(op: &str, err: impl std::error::Error + 'static) -> StorageError {
    StorageError::backend(format!("S3 {op}: {}", DisplayErrorContext(err)))
}

pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        S3BlobStore {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the storage section: region, optional custom endpoint with
    /// path-style addressing, and static credentials when both keys are set.
    pub async fn connect(config: &S3Config) -> Result<Self, StorageError> {
        if config.bucket.is_empty() {
            return Err(StorageError::InvalidRequest(
                "storage.s3.bucket is required".to_string(),
            ));
        }
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "static",
            ));
        }
        let shared = loader.load().await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "S3 blob store configured"
        );
        Ok(Self::new(Client::from_conf(builder.build()), &config.bucket))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data, metadata), fields(bucket = %self.bucket, %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, metadata: Metadata) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata((!metadata.is_empty()).then_some(metadata))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("PutObject", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    async fn get(&self, key: &str) -> Result<Option<StoredBlob>, StorageError> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => {
                let metadata = resp.metadata().cloned().unwrap_or_default();
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| s3_error("GetObject body", e))?
                    .into_bytes();
                Ok(Some(StoredBlob { data, metadata }))
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key()) =>
            {
                Ok(None)
            }
            Err(err) => Err(s3_error("GetObject", err)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    async fn head(&self, key: &str) -> Result<Option<Metadata>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => Ok(Some(resp.metadata().cloned().unwrap_or_default())),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_not_found()) =>
            {
                Ok(None)
            }
            Err(err) => Err(s3_error("HeadObject", err)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error("DeleteObject", e))?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(bucket = %self.bucket, count = keys.len()))]
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        if keys.len() > DELETE_BATCH {
            return Err(StorageError::InvalidRequest(format!(
                "batch delete of {} keys exceeds {DELETE_BATCH}",
                keys.len()
            )));
        }
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| s3_error("DeleteObjects request", e))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| s3_error("DeleteObjects request", e))?;
        let resp = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| s3_error("DeleteObjects", e))?;
        if let Some(first) = resp.errors().first() {
            return Err(StorageError::backend(format!(
                "S3 DeleteObjects: {} of {} keys failed, first {}: {}",
                resp.errors().len(),
                keys.len(),
                first.key().unwrap_or("?"),
                first.message().unwrap_or("unknown error")
            )));
        }
        debug!("batch deleted");
        Ok(())
    }

    #[instrument(skip(self, continuation), fields(bucket = %self.bucket, %prefix))]
    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<String>,
    ) -> Result<ListPage, StorageError> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_string))
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| s3_error("ListObjectsV2", e))?;
        Ok(ListPage {
            keys: resp
                .contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string))
                .collect(),
            common_prefixes: resp
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(str::to_string))
                .collect(),
            next: resp.next_continuation_token().map(str::to_string),
        })
    }
}
