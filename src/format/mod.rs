//! Report output formats.

mod csv;
mod json;

pub use self::csv::*;
pub use self::json::*;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::reference::ReferenceReport;
use crate::{ScanError, SymbolLookup};

/// Supported output formats for reference reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    Text,
    /// JSON format
    Json,
    /// CSV format (comma-separated values)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Text
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::Csv]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for reference reports
pub trait ReportFormatter {
    /// Format a report, resolving hit addresses through `lookup` when one
    /// is available.
    fn format(
        &self,
        report: &ReferenceReport,
        lookup: Option<&dyn SymbolLookup>,
    ) -> Result<String, ScanError>;
}

/// Format a report as plain text
pub struct TextFormatter;

/// Format a report as JSON
pub struct JsonFormatter;

/// Format a report as CSV
pub struct CsvFormatter;

fn describe(addr: u64, lookup: Option<&dyn SymbolLookup>) -> Option<String> {
    lookup.and_then(|l| l.summary(addr))
}

impl ReportFormatter for TextFormatter {
    fn format(
        &self,
        report: &ReferenceReport,
        lookup: Option<&dyn SymbolLookup>,
    ) -> Result<String, ScanError> {
        let mut output = String::new();

        if !report.direct.is_empty() {
            output.push_str("These are the scan results:\n");
            for addr in &report.direct {
                match describe(*addr, lookup) {
                    Some(summary) => output.push_str(&format!("0x{:x}: {}\n", addr, summary)),
                    None => output.push_str(&format!("0x{:x}\n", addr)),
                }
            }
        }
        output.push_str(&format!("Scan result count:{}\n", report.direct.len()));

        if !report.memory.is_empty() {
            output.push_str("These are the scan results in memory:\n");
            for addr in &report.memory {
                match describe(*addr, lookup) {
                    Some(summary) => output.push_str(&format!("0x{:x}: {}\n", addr, summary)),
                    None => output.push_str(&format!("0x{:x}\n", addr)),
                }
            }
        }
        output.push_str(&format!(
            "Scan result count in memory:{}\n",
            report.memory.len()
        ));

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceReport;

    fn sample_report() -> ReferenceReport {
        ReferenceReport {
            target: 0x1debec000,
            direct: vec![0x100004, 0x100010],
            memory: vec![0x100008],
        }
    }

    #[test]
    fn test_text_formatter() {
        let output = TextFormatter.format(&sample_report(), None).unwrap();
        assert!(output.contains("These are the scan results:"));
        assert!(output.contains("0x100004"));
        assert!(output.contains("Scan result count:2"));
        assert!(output.contains("Scan result count in memory:1"));
    }

    #[test]
    fn test_text_formatter_empty() {
        let report = ReferenceReport { target: 0x1000, direct: vec![], memory: vec![] };
        let output = TextFormatter.format(&report, None).unwrap();
        assert!(!output.contains("These are the scan results:"));
        assert!(output.contains("Scan result count:0"));
    }

    #[test]
    fn test_format_selection() {
        for format in OutputFormat::available_formats() {
            let formatter = format.get_formatter();
            let _ = formatter;
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
