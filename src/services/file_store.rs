use std::path::PathBuf;

use bytes::Bytes;
use uuid::Uuid;

use super::BlobStore;
use crate::{log_debug, RelayError, Result};

/// [`BlobStore`] writing each artifact to a uniquely named file.
///
/// Returned URIs are `{base_url}/{file}` when a base URL is configured (for a
/// directory served over HTTP or a mounted share), otherwise `file://` URIs.
pub struct FileBlobStore {
    root: PathBuf,
    base_url: Option<String>,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, content: Bytes, extension: &str) -> Result<String> {
        // ---
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RelayError::Storage(format!("creating {}: {e}", self.root.display())))?;

        let extension = extension.trim_start_matches('.');
        let name = if extension.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            format!("{}.{extension}", Uuid::new_v4())
        };
        let path = self.root.join(&name);

        tokio::fs::write(&path, &content)
            .await
            .map_err(|e| RelayError::Storage(format!("writing {}: {e}", path.display())))?;

        log_debug!("stored {} bytes at {}", content.len(), path.display());

        Ok(match &self.base_url {
            Some(base) => format!("{base}/{name}"),
            None => format!("file://{}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_put_writes_file_and_returns_file_uri() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("artifacts"), None);

        let uri = store.put(Bytes::from_static(b"%PDF"), ".pdf").await.unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with(".pdf"));

        let path = uri.trim_start_matches("file://");
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF");
    }

    #[tokio::test]
    async fn test_put_uses_base_url() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path(), Some("https://files.local/reports/".into()));

        let uri = store.put(Bytes::from_static(b"a,b"), "csv").await.unwrap();
        assert!(uri.starts_with("https://files.local/reports/"));
        assert!(uri.ends_with(".csv"));
    }
}
