//! External collaborators.
//!
//! The relay does not render or store anything itself. It drives a
//! [`RenderingService`] and a [`BlobStore`]; both are traits so deployments can
//! plug in their own. Reference implementations:
//!
//! - [`UrlAccessRenderer`] - report server URL-access endpoint over HTTP
//! - [`FileBlobStore`] - files under a local or mounted directory

mod file_store;
mod url_access;

pub use file_store::FileBlobStore;
pub use url_access::UrlAccessRenderer;

use bytes::Bytes;

use crate::{ReportCredential, ReportFormat, ReportParameter, Result};

/// Arguments of one render call.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub path: &'a str,
    pub credential: &'a ReportCredential,
    pub parameters: &'a [ReportParameter],
    pub language: Option<&'a str>,
    pub format: ReportFormat,
}

/// Output of a render call.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedArtifact {
    pub bytes: Bytes,
    pub mime_type: String,
    /// File extension without the dot.
    pub extension: String,
    pub warnings: Vec<String>,
}

/// Renders reports.
///
/// Implementations own their timeouts; the relay never cancels a render.
#[async_trait::async_trait]
pub trait RenderingService: Send + Sync {
    async fn execute(&self, request: RenderRequest<'_>) -> Result<RenderedArtifact>;
}

/// Stores rendered artifacts.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `content` and return the URI it can be fetched from.
    async fn put(&self, content: Bytes, extension: &str) -> Result<String>;
}
