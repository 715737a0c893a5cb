use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{parse_location, validate_object_name, ObjectStore};
use crate::error::StoreError;

/// S3-backed object store.
///
/// Works with AWS S3 and S3-compatible services (MinIO, etc.). Objects are
/// written under an optional key prefix and addressed as `s3://bucket/key`.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: String, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key_for(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, name),
            None => name.to_string(),
        }
    }

    /// Split an `s3://bucket/key` URI, checking it belongs to this bucket.
    fn key_from_location(&self, location: &str) -> Result<String, StoreError> {
        let url = parse_location(location, "s3")?;
        if url.host_str() != Some(self.bucket.as_str()) {
            return Err(StoreError::InvalidLocation(format!(
                "{} is not in bucket {}",
                location, self.bucket
            )));
        }
        let key = url.path().trim_start_matches('/');
        if key.is_empty() {
            return Err(StoreError::InvalidLocation(format!(
                "{} has no object key",
                location
            )));
        }
        urlencoding::decode(key)
            .map(|k| k.into_owned())
            .map_err(|e| StoreError::InvalidLocation(format!("{}: {}", location, e)))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StoreError> {
        validate_object_name(name)?;
        let key = self.key_for(name);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn get(&self, location: &str) -> Result<Bytes, StoreError> {
        let key = self.key_from_location(location)?;

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let no_such_key = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);

                // Some S3-compatible services answer a bare 404 instead
                let status_is_404 = e
                    .raw_response()
                    .map(|r| r.status().as_u16() == 404)
                    .unwrap_or(false);

                if no_such_key || status_is_404 {
                    return StoreError::NotFound(location.to_string());
                }
                classify_sdk_error(&e)
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .into_bytes();

        Ok(data)
    }
}

/// Network-level failures become `Connection`, everything else `Backend`.
fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> StoreError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            StoreError::Connection(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // S3-compatible services usually need path-style addressing
    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if endpoint_url.is_some() {
        builder = builder.force_path_style(true);
    }

    Client::from_conf(builder.build())
}
