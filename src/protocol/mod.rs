/// Wire contracts for the one request/reply pair this service handles.
///
/// Both are JSON with camelCase field names.
mod message;

pub use message::{ExecuteReport, ReportCredential, ReportExecuted, ReportFormat, ReportParameter};
