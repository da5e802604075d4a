//! JSON output formatter

use serde::{Deserialize, Serialize};

use super::{describe, ReportFormatter};
use crate::reference::ReferenceReport;
use crate::{ScanError, SymbolLookup};

/// Serializable hit for JSON output
#[derive(Serialize, Deserialize)]
struct HitJson {
    /// Address of the referencing instruction
    address: String,
    /// Symbol summary, when the image resolves one
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

/// Serializable report for JSON output
#[derive(Serialize, Deserialize)]
struct ReportJson {
    /// The queried address
    target: String,
    /// Instructions whose computed or branch target matched
    direct: Vec<HitJson>,
    /// Instructions that loaded the value out of memory
    memory: Vec<HitJson>,
}

fn hit(addr: u64, lookup: Option<&dyn SymbolLookup>) -> HitJson {
    HitJson {
        address: format!("0x{:x}", addr),
        summary: describe(addr, lookup),
    }
}

impl ReportFormatter for super::JsonFormatter {
    fn format(
        &self,
        report: &ReferenceReport,
        lookup: Option<&dyn SymbolLookup>,
    ) -> Result<String, ScanError> {
        let result = ReportJson {
            target: format!("0x{:x}", report.target),
            direct: report.direct.iter().map(|a| hit(*a, lookup)).collect(),
            memory: report.memory.iter().map(|a| hit(*a, lookup)).collect(),
        };

        serde_json::to_string_pretty(&result)
            .map_err(|e| ScanError::Generic(format!("JSON serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::JsonFormatter;
    use super::*;

    #[test]
    fn test_json_formatter() {
        let report = ReferenceReport {
            target: 0x1debec000,
            direct: vec![0x100004],
            memory: vec![],
        };
        let output = JsonFormatter.format(&report, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["target"], "0x1debec000");
        assert_eq!(value["direct"][0]["address"], "0x100004");
        assert_eq!(value["memory"].as_array().unwrap().len(), 0);
    }
}
