//! Object storage for original uploads and transformed variants.
//!
//! Objects are addressed by URI. Each backend hands out URIs in its own
//! scheme and only accepts URIs it issued:
//!
//! - [`S3ObjectStore`]: `s3://bucket/key`
//! - [`FsObjectStore`]: `file:///absolute/path`
//! - [`MemoryObjectStore`]: `mem://objects/name`
//!
//! Writers are expected to pick fresh names for every object; the stores
//! never need to overwrite.

mod fs;
mod memory;
mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::StoreError;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::{create_s3_client, S3ObjectStore};

/// Byte storage addressed by URI.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `name` and return the object's URI.
    ///
    /// `name` is a relative, `/`-separated path such as `images/abc.png`.
    async fn put(&self, name: &str, bytes: Bytes, content_type: &str)
        -> Result<String, StoreError>;

    /// Fetch the bytes stored at `location`.
    async fn get(&self, location: &str) -> Result<Bytes, StoreError>;
}

/// Parse `location` and check it uses `scheme`.
pub(crate) fn parse_location(location: &str, scheme: &str) -> Result<Url, StoreError> {
    let url = Url::parse(location)
        .map_err(|e| StoreError::InvalidLocation(format!("{}: {}", location, e)))?;
    if url.scheme() != scheme {
        return Err(StoreError::InvalidLocation(format!(
            "{} is not a {}:// location",
            location, scheme
        )));
    }
    Ok(url)
}

/// Reject names that are empty, absolute or escape their root.
pub(crate) fn validate_object_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StoreError::InvalidLocation(format!(
            "invalid object name '{}'",
            name
        )));
    }
    Ok(())
}
