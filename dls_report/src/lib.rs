//! Core report generation library for the DLS valve test rig.
//!
//! Turns a completed test's recorded sample file and metadata document into
//! deterministic PDF reports: per-channel production reports with hold-event
//! tables, and calibration reports with threshold evaluation and a fallback
//! correction polynomial.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub mod align;
pub mod calibrate;
pub mod chart;
pub mod data;
pub mod pdf;
pub mod report;
pub mod trim;

/// Column name of the ambient reference channel in the sample file.
pub const AMBIENT_CHANNEL: &str = "Ambient Temperature";

/// Column name assigned to the channel under calibration.
pub const CALIBRATED_CHANNEL: &str = "Calibrated Channel";

/// Calibration channel index reserved for the ambient reference channel.
pub const AMBIENT_CHANNEL_INDEX: u32 = 9;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("file is empty: {0}")]
    EmptyData(PathBuf),
    #[error("failed to parse {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("chart rendering failed: {0}")]
    Chart(String),
    #[error("pdf rendering failed: {0}")]
    Pdf(String),
}

impl ReportError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ReportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(path: &Path, reason: impl fmt::Display) -> Self {
        ReportError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Named test metadata stamped into filenames and document headers.
///
/// Every field is optional; absent fields render blank (or "N/A" where the
/// layout calls for it) and default to "Unknown" in filenames. Values arrive
/// as strings from the controller, including `Test Pressure`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TestMetadata {
    #[serde(rename = "Test Name", default)]
    pub test_name: Option<String>,
    #[serde(rename = "OTS Number", default)]
    pub ots_number: Option<String>,
    #[serde(rename = "Line Item", default)]
    pub line_item: Option<String>,
    #[serde(rename = "Unique Number", default)]
    pub unique_number: Option<String>,
    #[serde(rename = "Drawing Number", default)]
    pub drawing_number: Option<String>,
    #[serde(rename = "Client", default)]
    pub client: Option<String>,
    #[serde(rename = "Date Time", default)]
    pub date_time: Option<String>,
    #[serde(rename = "Test Date", default)]
    pub test_date: Option<String>,
    #[serde(
        rename = "Test Pressure",
        default,
        deserialize_with = "de_string_or_number"
    )]
    pub test_pressure: Option<String>,
    #[serde(rename = "Data Logger", default)]
    pub data_logger: Option<String>,
    #[serde(rename = "Serial Number", default)]
    pub serial_number: Option<String>,
    #[serde(rename = "User", default)]
    pub operator: Option<String>,
}

impl TestMetadata {
    /// Test pressure in psi, zero when absent or unparseable.
    pub fn test_pressure_value(&self) -> f64 {
        self.test_pressure
            .as_deref()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    /// Test date `dd/mm/yyyy`, extracted from the `dd-mm-yyyy_hh-mm-ss`
    /// combined field; falls back to the raw value when the shape differs.
    pub fn test_date_display(&self) -> String {
        let raw = match self.date_time.as_deref() {
            Some(value) if !value.is_empty() => value,
            _ => return String::new(),
        };
        let date_part = raw.split('_').next().unwrap_or(raw);
        let mut parts = date_part.splitn(3, '-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(m), Some(y)) if !y.is_empty() => format!("{d}/{m}/{y}"),
            _ => raw.to_string(),
        }
    }
}

/// The controller writes numeric metadata fields either as strings or as
/// raw numbers depending on firmware version; accept both.
fn de_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }))
}

/// Torque values arrive either as numbers or as pre-formatted strings.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TorqueValue {
    Number(f64),
    Text(String),
}

/// One record per physical/logical channel, loaded once per test.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub unique_number: String,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub transducer: String,
    #[serde(default)]
    pub breakout_torque: Option<TorqueValue>,
    #[serde(default)]
    pub running_torque: Option<TorqueValue>,
    #[serde(default)]
    pub end_of_test: Option<String>,
    #[serde(default)]
    pub start_of_stabilisation: Option<String>,
    #[serde(default)]
    pub start_of_hold: Option<String>,
    #[serde(default)]
    pub end_of_hold: Option<String>,
}

/// Parameters of a single calibration run.
#[derive(Clone, Debug, Deserialize)]
pub struct CalibrationInfo {
    pub channel_index: u32,
    /// Timestamps marking the start of each applied-value segment.
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub max_range: f64,
}

/// Metadata document: either a production test or a calibration run.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TestDocument {
    Production {
        metadata: TestMetadata,
        channel_info: Vec<ChannelInfo>,
    },
    Calibration {
        metadata: TestMetadata,
        calibration: CalibrationInfo,
    },
}

/// Load and parse the test details document.
pub fn load_test_document(path: &Path) -> Result<TestDocument, ReportError> {
    let text = fs::read_to_string(path).map_err(|e| ReportError::io(path, e))?;
    if text.trim().is_empty() {
        return Err(ReportError::EmptyData(path.to_path_buf()));
    }
    serde_json::from_str(&text).map_err(|e| ReportError::malformed(path, e))
}

/// The default channel names in their fixed, expected order.
pub const DEFAULT_CHANNEL_NAMES: [&str; 26] = [
    "Upstream",
    "Downstream",
    "Body",
    "Actuator",
    "Hyperbaric",
    "Backseat",
    "Spring Chamber",
    "Primary Stem Seal",
    "Secondary Stem Seal",
    "Relief Port",
    "BX Port",
    "Flow Meter",
    "Mass Spectrometer Mantissa",
    "Mass Spectrometer",
    "LVDT",
    "Torque",
    "Number Of Turns",
    "Motor Speed",
    "Ambient Temperature",
    "Body Temperature",
    "Monitor Temperature",
    "Chamber Temperature",
    "Hyperbaric Water Temperature",
    "Close",
    "Open",
    "Cycle Count",
];

/// Map each default channel name to its test-specific custom name.
///
/// `custom_names` is positional and may be shorter than the default list;
/// unmapped positions fall back to the default name, so every default name
/// is always a key.
pub fn channel_name_mapping(custom_names: &[String]) -> HashMap<String, String> {
    let mut mapping = HashMap::with_capacity(DEFAULT_CHANNEL_NAMES.len());
    for (index, default_name) in DEFAULT_CHANNEL_NAMES.iter().enumerate() {
        let custom = custom_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| (*default_name).to_string());
        mapping.insert((*default_name).to_string(), custom);
    }
    mapping
}

/// Format a torque value with units; zero or absent means no torque was
/// recorded and renders as "N/A". Pre-formatted strings pass through.
pub fn format_torque(value: Option<&TorqueValue>) -> String {
    match value {
        None => "N/A".to_string(),
        Some(TorqueValue::Number(v)) => {
            if *v == 0.0 {
                "N/A".to_string()
            } else if v.fract() == 0.0 {
                format!("{v:.0} ft.lbs")
            } else {
                format!("{v} ft.lbs")
            }
        }
        Some(TorqueValue::Text(raw)) => {
            let stripped = raw.trim();
            if stripped.is_empty() || stripped == "0" {
                "N/A".to_string()
            } else if stripped == "See Table" || stripped == "N/A" || stripped.ends_with("ft.lbs") {
                stripped.to_string()
            } else {
                format!("{stripped} ft.lbs")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_falls_back_to_defaults() {
        let custom = vec!["Environmental Port".to_string(), "Downstream".to_string()];
        let mapping = channel_name_mapping(&custom);
        assert_eq!(mapping.len(), DEFAULT_CHANNEL_NAMES.len());
        assert_eq!(mapping["Upstream"], "Environmental Port");
        assert_eq!(mapping["Downstream"], "Downstream");
        assert_eq!(mapping["Body"], "Body");
        assert_eq!(mapping["Cycle Count"], "Cycle Count");
    }

    #[test]
    fn torque_formatting() {
        assert_eq!(format_torque(None), "N/A");
        assert_eq!(format_torque(Some(&TorqueValue::Number(0.0))), "N/A");
        assert_eq!(format_torque(Some(&TorqueValue::Number(15.0))), "15 ft.lbs");
        assert_eq!(
            format_torque(Some(&TorqueValue::Text("15 ft.lbs".into()))),
            "15 ft.lbs"
        );
        assert_eq!(
            format_torque(Some(&TorqueValue::Text("See Table".into()))),
            "See Table"
        );
    }

    #[test]
    fn document_mode_detection() {
        let production = r#"{
            "metadata": {"OTS Number": "OTS-1"},
            "channel_info": [{"unique_number": "U100", "visible": true}]
        }"#;
        match serde_json::from_str::<TestDocument>(production).unwrap() {
            TestDocument::Production { channel_info, .. } => {
                assert_eq!(channel_info.len(), 1);
                assert!(channel_info[0].visible);
            }
            _ => panic!("expected production document"),
        }

        let calibration = r#"{
            "metadata": {"Date Time": "21-01-2026_14-55-37"},
            "calibration": {"channel_index": 3, "key_points": [], "max_range": 65535}
        }"#;
        match serde_json::from_str::<TestDocument>(calibration).unwrap() {
            TestDocument::Calibration { calibration, .. } => {
                assert_eq!(calibration.channel_index, 3);
            }
            _ => panic!("expected calibration document"),
        }
    }

    #[test]
    fn numeric_test_pressure_is_accepted() {
        let metadata: TestMetadata =
            serde_json::from_str(r#"{"Test Pressure": 5000}"#).unwrap();
        assert_eq!(metadata.test_pressure.as_deref(), Some("5000"));
        assert_eq!(metadata.test_pressure_value(), 5000.0);

        let metadata: TestMetadata =
            serde_json::from_str(r#"{"Test Pressure": "4500"}"#).unwrap();
        assert_eq!(metadata.test_pressure_value(), 4500.0);
    }

    #[test]
    fn test_date_from_combined_field() {
        let metadata = TestMetadata {
            date_time: Some("21-01-2026_14-55-37".to_string()),
            ..TestMetadata::default()
        };
        assert_eq!(metadata.test_date_display(), "21/01/2026");

        let odd = TestMetadata {
            date_time: Some("january".to_string()),
            ..TestMetadata::default()
        };
        assert_eq!(odd.test_date_display(), "january");
    }
}
