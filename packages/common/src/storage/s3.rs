use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::error::StorageError;
use super::hash::ContentHash;
use super::traits::{BlobStore, BoxReader};

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, R2, ...). Uses AWS when absent.
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Key prefix inside the bucket. Default: "receipts".
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".into()
}
fn default_prefix() -> String {
    "receipts".into()
}

/// Object-storage backend. Uploads are buffered in memory up to `max_size`
/// because the key is the content hash, which is only known after the last byte.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    prefix: String,
    max_size: u64,
}

impl S3BlobStore {
    pub fn new(config: &S3Config, max_size: u64) -> Result<Self, StorageError> {
        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse()
                .map_err(|e| StorageError::Backend(format!("invalid region: {e}")))?,
        };

        let credentials = Credentials::new(
            config.access_key.as_deref(),
            config.secret_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Backend(format!("invalid credentials: {e}")))?;

        let mut bucket = Bucket::new(&config.bucket, region, credentials).map_err(backend)?;
        if config.path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            prefix: config.prefix.trim_matches('/').to_string(),
            max_size,
        })
    }

    fn key(&self, hash: &ContentHash) -> String {
        if self.prefix.is_empty() {
            hash.object_key()
        } else {
            format!("{}/{}", self.prefix, hash.object_key())
        }
    }
}

fn backend(err: S3Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn is_not_found(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

fn check_status(code: u16, key: &str) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        other => Err(StorageError::Backend(format!(
            "unexpected status {other} for {key}"
        ))),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_stream(&self, reader: BoxReader) -> Result<ContentHash, StorageError> {
        let mut data = Vec::new();
        let read = reader.take(self.max_size + 1).read_to_end(&mut data).await?;
        if read as u64 > self.max_size {
            return Err(StorageError::SizeLimitExceeded {
                actual: read as u64,
                limit: self.max_size,
            });
        }

        let hash = ContentHash::compute(&data);
        if self.exists(&hash).await? {
            debug!(hash = %hash, "Object already stored, skipping upload");
            return Ok(hash);
        }

        let key = self.key(&hash);
        let response = self
            .bucket
            .put_object_with_content_type(&key, &data, "application/pdf")
            .await
            .map_err(backend)?;
        check_status(response.status_code(), &key)?;

        Ok(hash)
    }

    async fn get_stream(&self, hash: &ContentHash) -> Result<BoxReader, StorageError> {
        let key = self.key(hash);
        let response = match self.bucket.get_object(&key).await {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => return Err(StorageError::NotFound(hash.to_hex())),
            Err(e) => return Err(backend(e)),
        };
        check_status(response.status_code(), &key)
            .map_err(|e| match e {
                StorageError::NotFound(_) => StorageError::NotFound(hash.to_hex()),
                other => other,
            })?;

        Ok(Box::new(Cursor::new(response.bytes().to_vec())))
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        match self.bucket.head_object(self.key(hash)).await {
            Ok((_, code)) if (200..300).contains(&code) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, code)) => Err(StorageError::Backend(format!(
                "unexpected status {code} on HEAD"
            ))),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }

    async fn delete(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        if !self.exists(hash).await? {
            return Ok(false);
        }
        let key = self.key(hash);
        let response = self.bucket.delete_object(&key).await.map_err(backend)?;
        check_status(response.status_code(), &key)?;
        Ok(true)
    }

    async fn presigned_get_url(
        &self,
        hash: &ContentHash,
        ttl: Duration,
    ) -> Result<Option<String>, StorageError> {
        let expiry_secs = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX).max(1);
        let url = self
            .bucket
            .presign_get(self.key(hash), expiry_secs, None)
            .await
            .map_err(backend)?;
        Ok(Some(url))
    }
}
