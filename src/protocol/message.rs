use std::fmt;

use serde::{Deserialize, Serialize};

/// Request to render a report, consumed from the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteReport {
    /// Catalog path of the report, e.g. `/Sales/Quarterly`.
    pub report_path: String,

    /// Credential the report server executes the report with.
    pub credential: ReportCredential,

    #[serde(default)]
    pub parameters: Vec<ReportParameter>,

    /// Culture used to parse parameter values, e.g. `en-US`.
    #[serde(default)]
    pub parameter_language: Option<String>,

    pub format: ReportFormat,
}

/// Report server credential carried in the request.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCredential {
    pub user_name: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl fmt::Debug for ReportCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportCredential")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// One report parameter. Multi-valued parameters repeat the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportParameter {
    pub name: String,
    pub value: Option<String>,
}

impl ReportParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// Output formats supported by the report server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportFormat {
    Pdf,
    Excel,
    ExcelOpenXml,
    Word,
    WordOpenXml,
    Csv,
    Xml,
    Image,
    Mhtml,
    Html,
}

impl ReportFormat {
    /// Render-extension name understood by the report server.
    pub fn render_name(self) -> &'static str {
        match self {
            ReportFormat::Pdf => "PDF",
            ReportFormat::Excel => "EXCEL",
            ReportFormat::ExcelOpenXml => "EXCELOPENXML",
            ReportFormat::Word => "WORD",
            ReportFormat::WordOpenXml => "WORDOPENXML",
            ReportFormat::Csv => "CSV",
            ReportFormat::Xml => "XML",
            ReportFormat::Image => "IMAGE",
            ReportFormat::Mhtml => "MHTML",
            ReportFormat::Html => "HTML4.0",
        }
    }

    /// File extension of the rendered artifact, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Excel => "xls",
            ReportFormat::ExcelOpenXml => "xlsx",
            ReportFormat::Word => "doc",
            ReportFormat::WordOpenXml => "docx",
            ReportFormat::Csv => "csv",
            ReportFormat::Xml => "xml",
            ReportFormat::Image => "tif",
            ReportFormat::Mhtml => "mhtml",
            ReportFormat::Html => "html",
        }
    }
}

/// Reply to [`ExecuteReport`].
///
/// Processing failures are reported in `messages` with no `uri`; the
/// requester always receives a reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportExecuted {
    /// Where the rendered artifact was stored.
    pub uri: Option<String>,

    pub content_type: Option<String>,

    pub file_extension: Option<String>,

    /// Artifact size in bytes.
    pub length: u64,

    /// Renderer warnings and processing errors.
    #[serde(default)]
    pub messages: Vec<String>,
}

impl ReportExecuted {
    /// Reply describing a failed execution.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
            ..Self::default()
        }
    }

    /// Whether an artifact was produced.
    pub fn succeeded(&self) -> bool {
        self.uri.is_some()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_request_wire_format() {
        // ---
        let json = r#"{
            "reportPath": "/Sales/Quarterly",
            "credential": { "userName": "svc", "password": "pw" },
            "parameters": [ { "name": "Year", "value": "2026" } ],
            "parameterLanguage": "en-US",
            "format": "ExcelOpenXml"
        }"#;

        let req: ExecuteReport = serde_json::from_str(json).unwrap();
        assert_eq!(req.report_path, "/Sales/Quarterly");
        assert_eq!(req.credential.domain, None);
        assert_eq!(req.parameters, vec![ReportParameter::new("Year", "2026")]);
        assert_eq!(req.format, ReportFormat::ExcelOpenXml);
        assert_eq!(req.format.extension(), "xlsx");
    }

    #[test]
    fn test_failed_reply() {
        // ---
        let reply = ReportExecuted::failed("boom");
        assert!(!reply.succeeded());
        assert_eq!(reply.length, 0);

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["messages"][0], "boom");
        assert!(json["uri"].is_null());
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        // ---
        let cred = ReportCredential {
            user_name: "svc".into(),
            password: "hunter2".into(),
            domain: None,
        };
        assert!(!format!("{cred:?}").contains("hunter2"));
    }
}
