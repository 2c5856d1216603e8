//! Aligned plain-text rendering, for terminals and logs.

use super::table::AttributeTable;
use super::Report;
use crate::error::ReportError;
use crate::parser::AttributeValue;

const ABSENT_CELL: &str = "-";

/// Renders the selected columns as a whitespace-aligned table.
#[derive(Debug, Clone)]
pub struct TableReport {
    attributes: Vec<String>,
}

impl TableReport {
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }
}

impl Report for TableReport {
    fn name(&self) -> &str {
        "table"
    }

    fn render(&self, table: &AttributeTable) -> Result<Vec<u8>, ReportError> {
        if self.attributes.is_empty() {
            return Err(ReportError::NoColumns);
        }

        let rows: Vec<Vec<String>> = table
            .records()
            .iter()
            .map(|record| {
                self.attributes
                    .iter()
                    .map(|a| match record.get(a) {
                        AttributeValue::Absent => ABSENT_CELL.to_string(),
                        value => value.to_string(),
                    })
                    .collect()
            })
            .collect();

        let widths: Vec<usize> = self
            .attributes
            .iter()
            .enumerate()
            .map(|(i, name)| {
                rows.iter()
                    .map(|row| row[i].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = String::new();
        push_row(&mut out, &self.attributes, &widths);
        for row in &rows {
            push_row(&mut out, row, &widths);
        }
        Ok(out.into_bytes())
    }
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}
