//! Attribute tables and the reports rendered from them.
//!
//! Reports are pure functions of an [`AttributeTable`] snapshot: they project
//! the table onto a caller-chosen column list and serialize it. Rows keep the
//! run registration order and columns keep the requested order.

pub mod csv;
pub mod table;
pub mod text;

pub use self::csv::CsvReport;
pub use table::{AttributeRecord, AttributeTable, RecordError};
pub use text::TableReport;

use crate::error::ReportError;

/// Capability interface for report renderers.
pub trait Report: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Renders the table; must not depend on anything but the table.
    fn render(&self, table: &AttributeTable) -> Result<Vec<u8>, ReportError>;
}
