//! Report rendering through the report server's URL-access endpoint.
//!
//! A render is a single authenticated `GET`:
//!
//! ```text
//! {server}?/Folder/Report&rs:Command=Render&rs:Format=PDF&Year=2026
//! ```
//!
//! URL access returns the artifact bytes directly and reports no warnings.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use super::{RenderRequest, RenderedArtifact, RenderingService};
use crate::encoding::percent_encode;
use crate::{log_debug, RelayError, Result};

const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Longest error body quoted back to the requester.
const MAX_ERROR_BODY: usize = 512;

/// [`RenderingService`] backed by report server URL access.
pub struct UrlAccessRenderer {
    http: reqwest::Client,
    server_url: String,
}

impl UrlAccessRenderer {
    /// Create a renderer for the given report server URL, e.g.
    /// `http://reports.local/ReportServer`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MissingConfig`] for an empty URL and
    /// [`RelayError::Rendering`] if the HTTP client cannot be built.
    pub fn new(server_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // ---
        let server_url = server_url.into().trim_end_matches('/').to_string();
        if server_url.is_empty() {
            return Err(RelayError::MissingConfig("report server url".into()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Rendering(format!("http client: {e}")))?;

        Ok(Self { http, server_url })
    }

    /// URL rendering `request`.
    pub fn render_url(&self, request: &RenderRequest<'_>) -> String {
        // ---
        let path = if request.path.starts_with('/') {
            request.path.to_string()
        } else {
            format!("/{}", request.path)
        };

        let mut url = format!(
            "{}?{}&rs:Command=Render&rs:Format={}",
            self.server_url,
            percent_encode(&path, b"/"),
            request.format.render_name()
        );

        if let Some(language) = request.language.filter(|l| !l.is_empty()) {
            url.push_str("&rs:ParameterLanguage=");
            url.push_str(&percent_encode(language, &[]));
        }

        for param in request.parameters {
            let name = percent_encode(&param.name, &[]);
            match &param.value {
                Some(value) => {
                    url.push_str(&format!("&{name}={}", percent_encode(value, &[])));
                }
                None => url.push_str(&format!("&{name}:isnull=true")),
            }
        }

        url
    }
}

#[async_trait::async_trait]
impl RenderingService for UrlAccessRenderer {
    async fn execute(&self, request: RenderRequest<'_>) -> Result<RenderedArtifact> {
        // ---
        let url = self.render_url(&request);
        log_debug!("rendering {} as {:?}", request.path, request.format);

        let credential = request.credential;
        let user = match credential.domain.as_deref().filter(|d| !d.is_empty()) {
            Some(domain) => format!("{domain}\\{}", credential.user_name),
            None => credential.user_name.clone(),
        };

        let response = self
            .http
            .get(&url)
            .basic_auth(user, Some(&credential.password))
            .send()
            .await
            .map_err(|e| RelayError::Rendering(format!("request to report server failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(RelayError::Rendering(format!(
                "report server returned {status} for {}: {body}",
                request.path
            )));
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(FALLBACK_MIME_TYPE)
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::Rendering(format!("reading rendered report failed: {e}")))?;

        Ok(RenderedArtifact {
            bytes,
            mime_type,
            extension: request.format.extension().to_string(),
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{ReportCredential, ReportFormat, ReportParameter};

    fn credential() -> ReportCredential {
        ReportCredential {
            user_name: "svc".into(),
            password: "pw".into(),
            domain: None,
        }
    }

    #[test]
    fn test_render_url() {
        // ---
        let renderer =
            UrlAccessRenderer::new("http://reports.local/ReportServer/", Duration::from_secs(5))
                .unwrap();
        let cred = credential();
        let params = [
            ReportParameter::new("Year", "2026"),
            ReportParameter::new("Region", "North & South"),
            ReportParameter {
                name: "Manager".into(),
                value: None,
            },
        ];

        let url = renderer.render_url(&RenderRequest {
            path: "Sales/Quarterly Report",
            credential: &cred,
            parameters: &params,
            language: Some("en-US"),
            format: ReportFormat::Pdf,
        });

        assert_eq!(
            url,
            "http://reports.local/ReportServer?/Sales/Quarterly%20Report\
             &rs:Command=Render&rs:Format=PDF&rs:ParameterLanguage=en-US\
             &Year=2026&Region=North%20%26%20South&Manager:isnull=true"
        );
    }

    #[test]
    fn test_empty_server_url_rejected() {
        // ---
        let err = UrlAccessRenderer::new("", Duration::from_secs(5)).err().unwrap();
        assert!(err.is_config());
    }
}
