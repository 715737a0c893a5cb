use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{validate_object_name, ObjectStore};
use crate::error::StoreError;

const SCHEME_PREFIX: &str = "mem://objects/";

/// In-process object store, for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    content_type: String,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// URIs of every object whose name starts with `prefix`, sorted.
    pub async fn locations_with_prefix(&self, prefix: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        let mut locations: Vec<String> = objects
            .keys()
            .filter(|name| name.starts_with(prefix))
            .map(|name| format!("{}{}", SCHEME_PREFIX, name))
            .collect();
        locations.sort();
        locations
    }

    /// Content type recorded for `location`.
    pub async fn content_type(&self, location: &str) -> Option<String> {
        let name = location.strip_prefix(SCHEME_PREFIX)?;
        let objects = self.objects.read().await;
        objects.get(name).map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StoreError> {
        validate_object_name(name)?;
        let mut objects = self.objects.write().await;
        objects.insert(
            name.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("{}{}", SCHEME_PREFIX, name))
    }

    async fn get(&self, location: &str) -> Result<Bytes, StoreError> {
        let name = location
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| StoreError::InvalidLocation(location.to_string()))?;
        let objects = self.objects.read().await;
        objects
            .get(name)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(location.to_string()))
    }
}
