//! Report generation for screen results.
//!
//! Generates reports in three formats:
//! - CSV (spreadsheet import)
//! - JSON (programmatic use)
//! - Codes (one symbol per line, for charting tools' watchlist import)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::engine::{ScreenHit, ScreenOutcome};

// ============================================================================
// Report Format
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    /// Header row plus one ranked row per hit
    Csv,
    /// The serialized outcome
    Json,
    /// Codes only, one per line
    Codes,
}

impl ReportFormat {
    fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Codes => "txt",
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Csv => write!(f, "csv"),
            Self::Json => write!(f, "json"),
            Self::Codes => write!(f, "codes"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "codes" | "txt" => Ok(Self::Codes),
            _ => Err(format!("Unknown report format: {}", s)),
        }
    }
}

// ============================================================================
// Screen Report
// ============================================================================

pub struct ScreenReport {
    outcome: ScreenOutcome,
    market_suffix: bool,
}

impl ScreenReport {
    pub fn new(outcome: ScreenOutcome) -> Self {
        Self {
            outcome,
            market_suffix: true,
        }
    }

    /// Append `.TW` / `.TWO` to codes in the Codes format.
    pub fn with_market_suffix(mut self, enabled: bool) -> Self {
        self.market_suffix = enabled;
        self
    }

    pub fn generate(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Csv => self.to_csv(),
            ReportFormat::Json => self.to_json(),
            ReportFormat::Codes => self.to_codes(),
        }
    }

    /// Write the report, adding the format's extension when `path` has none.
    pub fn save_to_file(&self, path: &Path, format: ReportFormat) -> Result<PathBuf> {
        let content = self.generate(format);

        let file_path = if path.extension().is_none() {
            path.with_extension(format.extension())
        } else {
            path.to_path_buf()
        };

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create report directory")?;
        }

        std::fs::write(&file_path, content).context("Failed to write report file")?;

        Ok(file_path)
    }

    pub fn to_csv(&self) -> String {
        let mut csv = String::from("rank,code,name,market,metric,close,volume\n");
        for (i, hit) in self.outcome.hits.iter().enumerate() {
            csv.push_str(&format!(
                "{},{},{},{},{:.2},{:.2},{}\n",
                i + 1,
                hit.symbol.code,
                csv_field(&hit.symbol.name),
                hit.symbol.market,
                hit.signal.metric(),
                hit.close,
                hit.volume
            ));
        }
        csv
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.outcome).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn to_codes(&self) -> String {
        self.outcome
            .hits
            .iter()
            .map(|hit| self.code_line(hit))
            .collect()
    }

    fn code_line(&self, hit: &ScreenHit) -> String {
        if self.market_suffix {
            format!("{}\n", hit.symbol.suffixed_code())
        } else {
            format!("{}\n", hit.symbol.code)
        }
    }

    pub fn outcome(&self) -> &ScreenOutcome {
        &self.outcome
    }
}

/// Quote a CSV field when it contains a separator or quote.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Market, Symbol};
    use crate::screener::engine::Signal;
    use crate::screener::Criterion;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn create_test_outcome() -> ScreenOutcome {
        let hit = |code: &str, name: &str, market, pct: f64| ScreenHit {
            symbol: Symbol::new(code, name, market),
            date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            close: 100.5,
            volume: 1234,
            signal: Signal::Volatility { volatility_pct: pct },
        };
        ScreenOutcome {
            criterion: Criterion::Volatility {
                days: 30,
                min_pct: 30.0,
            },
            hits: vec![
                hit("2330", "台積電", Market::Twse, 45.0),
                hit("6488", "環球晶", Market::Tpex, 31.3),
            ],
            scanned: 1800,
            matched: 2,
            insufficient: 12,
            errored: 0,
            elapsed: Duration::from_millis(5500),
        }
    }

    #[test]
    fn test_csv_generation() {
        let csv = ScreenReport::new(create_test_outcome()).to_csv();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], "rank,code,name,market,metric,close,volume");
        assert_eq!(lines[1], "1,2330,台積電,twse,45.00,100.50,1234");
        assert_eq!(lines[2], "2,6488,環球晶,tpex,31.30,100.50,1234");
    }

    #[test]
    fn test_json_generation() {
        let json = ScreenReport::new(create_test_outcome()).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["scanned"], 1800);
        assert_eq!(value["criterion"]["kind"], "volatility");
        assert_eq!(value["hits"][0]["signal"]["kind"], "volatility");
        assert_eq!(value["elapsed"], 5.5);
    }

    #[test]
    fn test_codes_with_and_without_suffix() {
        let report = ScreenReport::new(create_test_outcome());
        assert_eq!(report.to_codes(), "2330.TW\n6488.TWO\n");

        let report = report.with_market_suffix(false);
        assert_eq!(report.to_codes(), "2330\n6488\n");
    }

    #[test]
    fn test_save_adds_extension_and_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let report = ScreenReport::new(create_test_outcome());

        let written = report
            .save_to_file(&dir.path().join("nested/volatility"), ReportFormat::Csv)
            .unwrap();
        assert_eq!(written, dir.path().join("nested/volatility.csv"));
        assert!(std::fs::read_to_string(&written).unwrap().starts_with("rank,"));

        let written = report
            .save_to_file(&dir.path().join("codes.list"), ReportFormat::Codes)
            .unwrap();
        assert_eq!(written, dir.path().join("codes.list"));
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_report_format_parsing() {
        assert_eq!("csv".parse::<ReportFormat>().unwrap(), ReportFormat::Csv);
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("txt".parse::<ReportFormat>().unwrap(), ReportFormat::Codes);
        assert!("markdown".parse::<ReportFormat>().is_err());
    }
}
