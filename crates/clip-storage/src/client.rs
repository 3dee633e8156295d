//! Object storage client abstraction and the AWS SDK implementation.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use crate::error::StorageError;

/// Static credentials for environments without a provider chain.
#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Identity of a remote archive object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse an `s3://bucket/key` URI. Returns `None` for anything else.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest: &str = uri.strip_prefix("s3://")?;
        let (bucket, key) = rest.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(bucket, key))
    }
}

impl std::fmt::Display for S3Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Low-level object operations required from a storage collaborator.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Check if an object exists and return its size.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>, StorageError>;

    /// Fetch exactly `[offset, offset + length)` of an object. The range
    /// is clamped server-side if it runs past the object's end.
    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError>;

    /// Upload a local file as an object, streaming from disk.
    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<(), StorageError>;
}

/// `StorageClient` backed by the AWS SDK for Rust.
pub struct S3StorageClient {
    client: S3Client,
}

impl S3StorageClient {
    /// Create a client from the default credential and region chain.
    ///
    /// Region resolution follows the standard chain (`AWS_REGION`, profile,
    /// IMDS); `region` overrides it when given.
    pub async fn new(region: Option<String>) -> Result<Self, StorageError> {
        Self::with_credentials(region, None).await
    }

    /// Create a client, optionally pinning static credentials instead of
    /// the default provider chain.
    pub async fn with_credentials(
        region: Option<String>,
        credentials: Option<S3Credentials>,
    ) -> Result<Self, StorageError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region));
        }
        if let Some(creds) = credentials {
            loader = loader.credentials_provider(Credentials::new(
                creds.access_key_id,
                creds.secret_access_key,
                creds.session_token,
                None,
                "clip",
            ));
        }
        let sdk_config = loader.load().await;
        Ok(Self {
            client: S3Client::new(&sdk_config),
        })
    }

    /// Wrap an existing SDK client (for tests and shared configuration).
    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StorageClient for S3StorageClient {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(output.content_length().map(|l| l as u64)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(StorageError::Network {
                        key: format!("s3://{}/{}", bucket, key),
                        message: service_err.to_string(),
                    })
                }
            }
        }
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        // HTTP ranges are inclusive on both ends.
        let range: String = format!("bytes={}-{}", offset, offset + length - 1);
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|err| StorageError::Network {
                key: format!("s3://{}/{}", bucket, key),
                message: err.into_service_error().to_string(),
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Network {
                key: format!("s3://{}/{}", bucket, key),
                message: err.to_string(),
            })?;
        Ok(data.into_bytes().to_vec())
    }

    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<(), StorageError> {
        let body: ByteStream =
            ByteStream::from_path(path)
                .await
                .map_err(|err| StorageError::Io {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| StorageError::Network {
                key: format!("s3://{}/{}", bucket, key),
                message: err.into_service_error().to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_uri() {
        let location: S3Location = S3Location::parse("s3://bucket/path/to/archive.clip").unwrap();
        assert_eq!(location.bucket, "bucket");
        assert_eq!(location.key, "path/to/archive.clip");
        assert_eq!(location.to_string(), "s3://bucket/path/to/archive.clip");
    }

    #[test]
    fn test_parse_rejects_non_s3() {
        assert!(S3Location::parse("/plain/path.clip").is_none());
        assert!(S3Location::parse("http://host/x").is_none());
        assert!(S3Location::parse("s3://bucket-only").is_none());
        assert!(S3Location::parse("s3:///no-bucket").is_none());
    }
}
