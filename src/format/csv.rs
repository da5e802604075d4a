//! CSV output formatter

use super::{describe, ReportFormatter};
use crate::reference::ReferenceReport;
use crate::{ScanError, SymbolLookup};

impl ReportFormatter for super::CsvFormatter {
    fn format(
        &self,
        report: &ReferenceReport,
        lookup: Option<&dyn SymbolLookup>,
    ) -> Result<String, ScanError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["kind", "target", "address", "summary"])
            .map_err(|e| ScanError::Generic(format!("CSV error: {}", e)))?;

        let target = format!("0x{:x}", report.target);
        for (kind, addrs) in [("direct", &report.direct), ("memory", &report.memory)] {
            for addr in addrs {
                let address = format!("0x{:x}", addr);
                let summary = describe(*addr, lookup).unwrap_or_default();
                writer
                    .write_record([kind, target.as_str(), address.as_str(), summary.as_str()])
                    .map_err(|e| ScanError::Generic(format!("CSV error: {}", e)))?;
            }
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| ScanError::Generic(format!("CSV error: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| ScanError::Generic(format!("CSV error: {}", e)))
    }
}
