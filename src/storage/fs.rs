use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use super::{parse_location, validate_object_name, ObjectStore};
use crate::error::StoreError;

/// Object store on the local filesystem.
///
/// Objects live under a root directory and are addressed as `file://` URIs.
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a partial object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| io_error(root, &e))?;
        let root = root.canonicalize().map_err(|e| io_error(root, &e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_from_location(&self, location: &str) -> Result<PathBuf, StoreError> {
        let url = parse_location(location, "file")?;
        let path = url
            .to_file_path()
            .map_err(|_| StoreError::InvalidLocation(location.to_string()))?;
        if !path.starts_with(&self.root) {
            return Err(StoreError::InvalidLocation(format!(
                "{} is outside {}",
                location,
                self.root.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        name: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        validate_object_name(name)?;
        let path = self.root.join(name);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, &e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(&path, &e));
        }

        Url::from_file_path(&path)
            .map(String::from)
            .map_err(|_| StoreError::InvalidLocation(path.display().to_string()))
    }

    async fn get(&self, location: &str) -> Result<Bytes, StoreError> {
        let path = self.path_from_location(location)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(location.to_string()))
            }
            Err(e) => Err(io_error(&path, &e)),
        }
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Backend(format!("{}: {}", path.display(), err))
}
