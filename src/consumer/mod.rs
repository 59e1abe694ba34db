//! Consumer dispatch.
//!
//! - [`MessageConsumer`] - typed consumer contract
//! - [`ExecuteReportConsumer`] - the one consumer this service registers

mod binding;
mod execute_report;

pub use binding::MessageConsumer;
pub(crate) use binding::{bind, EnvelopeHandler};
pub use execute_report::ExecuteReportConsumer;
