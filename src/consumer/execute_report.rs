use std::sync::Arc;

use crate::services::{BlobStore, RenderRequest, RenderingService};
use crate::{
    //
    log_info,
    log_warn,
    ExecuteReport,
    MessageConsumer,
    ReportExecuted,
    Result,
};

/// Consumer for [`ExecuteReport`]: render, store, reply with the URI.
///
/// Rendering and storage failures become a reply with the error in
/// `messages`, so a requester is never left waiting on a fault.
pub struct ExecuteReportConsumer {
    renderer: Arc<dyn RenderingService>,
    store: Arc<dyn BlobStore>,
}

impl ExecuteReportConsumer {
    pub fn new(renderer: Arc<dyn RenderingService>, store: Arc<dyn BlobStore>) -> Self {
        Self { renderer, store }
    }
}

#[async_trait::async_trait]
impl MessageConsumer for ExecuteReportConsumer {
    type Message = ExecuteReport;
    type Reply = ReportExecuted;

    fn message_type(&self) -> &'static str {
        "ExecuteReport"
    }

    async fn consume(&self, request: ExecuteReport) -> Result<ReportExecuted> {
        // ---
        let render = RenderRequest {
            path: &request.report_path,
            credential: &request.credential,
            parameters: &request.parameters,
            language: request.parameter_language.as_deref(),
            format: request.format,
        };

        let artifact = match self.renderer.execute(render).await {
            Ok(artifact) => artifact,
            Err(e) => {
                log_warn!("rendering {} failed: {e}", request.report_path);
                return Ok(ReportExecuted::failed(e.to_string()));
            }
        };

        let length = artifact.bytes.len() as u64;
        let uri = match self.store.put(artifact.bytes, &artifact.extension).await {
            Ok(uri) => uri,
            Err(e) => {
                log_warn!("storing {} failed: {e}", request.report_path);
                let mut reply = ReportExecuted::failed(e.to_string());
                reply.messages.extend(artifact.warnings);
                return Ok(reply);
            }
        };

        log_info!("rendered {} ({length} bytes) to {uri}", request.report_path);

        Ok(ReportExecuted {
            uri: Some(uri),
            content_type: Some(artifact.mime_type),
            file_extension: Some(artifact.extension),
            length,
            messages: artifact.warnings,
        })
    }
}
