//! CSV rendering of the attribute table.

use csv::{QuoteStyle, WriterBuilder};

use super::table::AttributeTable;
use super::Report;
use crate::error::ReportError;
use crate::parser::AttributeValue;

/// Projects the table onto a fixed column list and renders it as CSV.
///
/// Missing attributes become an empty, unquoted cell. A present but empty
/// string is written as `""` so the two stay distinguishable.
#[derive(Debug, Clone)]
pub struct CsvReport {
    attributes: Vec<String>,
    delimiter: u8,
}

impl CsvReport {
    /// Creates a report over the given columns, in the given order.
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: attributes.into_iter().map(Into::into).collect(),
            delimiter: b',',
        }
    }

    /// Sets the field delimiter.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    fn cell(&self, value: &AttributeValue) -> String {
        match value {
            AttributeValue::Absent => String::new(),
            AttributeValue::Int(_) | AttributeValue::Float(_) => value.to_string(),
            other => self.quote(&other.to_string()),
        }
    }

    fn quote(&self, text: &str) -> String {
        let needs_quotes = text.is_empty()
            || text
                .bytes()
                .any(|b| b == self.delimiter || b == b'"' || b == b'\n' || b == b'\r');
        if needs_quotes {
            format!("\"{}\"", text.replace('"', "\"\""))
        } else {
            text.to_string()
        }
    }
}

impl Report for CsvReport {
    fn name(&self) -> &str {
        "csv"
    }

    fn render(&self, table: &AttributeTable) -> Result<Vec<u8>, ReportError> {
        if self.attributes.is_empty() {
            return Err(ReportError::NoColumns);
        }

        // Cells are quoted above; the writer only joins fields and rows.
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote_style(QuoteStyle::Never)
            .from_writer(Vec::new());

        let header: Vec<String> = self.attributes.iter().map(|a| self.quote(a)).collect();
        writer.write_record(&header)?;

        for record in table.records() {
            let row: Vec<String> = self
                .attributes
                .iter()
                .map(|attribute| self.cell(record.get(attribute)))
                .collect();
            writer.write_record(&row)?;
        }

        writer
            .into_inner()
            .map_err(|e| ReportError::Io(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::AttributeRecord;

    fn scenario_table() -> AttributeTable {
        let mut table = AttributeTable::new();

        let mut solved = AttributeRecord::new("a");
        solved.set("id", "a");
        solved.set("solve_time", 12.5);
        solved.set("status", "OPTIMAL");
        table.push(solved);

        let mut timed_out = AttributeRecord::new("b");
        timed_out.set("id", "b");
        timed_out.set("solve_time", 60.0);
        timed_out.set("status", AttributeValue::Absent);
        table.push(timed_out);

        let mut missing = AttributeRecord::new("c");
        missing.set("id", "c");
        missing.record_error("solve_time", "required attribute 'solve_time' not found");
        table.push(missing);

        table
    }

    #[test]
    fn test_render_scenario() {
        let report = CsvReport::new(["id", "solve_time", "status"]);
        let bytes = report.render(&scenario_table()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "id,solve_time,status");
        assert_eq!(lines[1], "a,12.5,OPTIMAL");
        assert_eq!(lines[2], "b,60.0,");
        assert_eq!(
            lines[3],
            "c,ERROR: required attribute 'solve_time' not found,"
        );
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_absent_distinct_from_zero_and_empty() {
        let mut table = AttributeTable::new();
        for (id, value) in [
            ("absent", AttributeValue::Absent),
            ("zero", AttributeValue::Int(0)),
            ("empty", AttributeValue::Str(String::new())),
        ] {
            let mut record = AttributeRecord::new(id);
            record.set("id", id);
            record.set("value", value);
            table.push(record);
        }

        let text = String::from_utf8(CsvReport::new(["id", "value"]).render(&table).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "absent,");
        assert_eq!(lines[2], "zero,0");
        assert_eq!(lines[3], "empty,\"\"");
    }

    #[test]
    fn test_quoting_and_column_order() {
        let mut table = AttributeTable::new();
        let mut record = AttributeRecord::new("r");
        record.set("note", "a,b \"c\"");
        record.set("id", "r");
        table.push(record);

        let text = String::from_utf8(CsvReport::new(["note", "id"]).render(&table).unwrap()).unwrap();
        assert_eq!(text.lines().nth(1), Some("\"a,b \"\"c\"\"\",r"));
    }

    #[test]
    fn test_render_is_pure() {
        let table = scenario_table();
        let snapshot = table.clone();
        let report = CsvReport::new(["id", "status"]);
        let first = report.render(&table).unwrap();
        let second = report.render(&table).unwrap();
        assert_eq!(first, second);
        assert_eq!(table, snapshot);
    }

    #[test]
    fn test_no_columns() {
        let report = CsvReport::new(Vec::<String>::new());
        assert!(matches!(
            report.render(&AttributeTable::new()),
            Err(ReportError::NoColumns)
        ));
    }
}
