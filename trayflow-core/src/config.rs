//! Configuration types
//!
//! Loaded from TOML, overlaid with `TRAYFLOW_*` environment variables, then
//! validated. The core never writes configuration back.

use crate::error::ConfigError;
use crate::period::Granularity;
use crate::station::StationOrder;
use crate::normalize_key;
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Column names a disposition sheet can map.
pub const DISPOSITION_FIELDS: [&str; 7] = [
    "sn",
    "nv_disposition",
    "status",
    "pic",
    "igs_action",
    "igs_status",
    "nvpn",
];

/// Columns that must be present in a disposition sheet header.
pub const REQUIRED_DISPOSITION_COLUMNS: [&str; 6] = [
    "sn",
    "nv_disposition",
    "status",
    "pic",
    "igs_action",
    "igs_status",
];

/// Where a serial number's tray comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraySource {
    /// Every serial number is its own tray.
    #[default]
    Serial,
    /// The `tray_id` carried on the serial's rows.
    RowMetadata,
}

/// Bonepile workbook settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BonepileConfig {
    /// Known non-disposition sheets. Every other sheet is a category.
    pub ignore_sheets: Vec<String>,
    /// Per-row fields whose absence skips the row as a validation error.
    pub required_fields: Vec<String>,
    /// Pattern a normalized serial number must match.
    pub sn_pattern: String,
    /// Keep serials from earlier uploads in the bonepile set.
    pub accumulate: bool,
    /// Rows scanned for the `SN` header cell.
    pub header_scan_rows: usize,
    /// Consecutive blank rows that end a sheet.
    pub max_blank_run: usize,
}

impl Default for BonepileConfig {
    fn default() -> Self {
        Self {
            ignore_sheets: ["SUMMARY", "DASHBOARD", "PIVOT", "README", "INSTRUCTIONS", "LOOKUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required_fields: vec!["sn".to_string()],
            sn_pattern: r"^18\d{11}$".to_string(),
            accumulate: false,
            header_scan_rows: 300,
            max_blank_run: 200,
        }
    }
}

impl BonepileConfig {
    pub fn is_ignored_sheet(&self, sheet: &str) -> bool {
        let key = normalize_key(sheet);
        self.ignore_sheets.iter().any(|s| normalize_key(s) == key)
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Canonical station order.
    pub stations_order: Vec<String>,
    /// Pass station → part numbers that finish there.
    pub pass_rules: BTreeMap<String, Vec<String>>,
    /// IANA name of the reporting timezone.
    pub timezone: String,
    /// Default time-breakdown granularity.
    pub aggregation: Granularity,
    pub tray_source: TraySource,
    pub top_k_errors: usize,
    /// Ascending TTC histogram thresholds, in minutes.
    pub ttc_thresholds_minutes: Vec<u32>,
    /// Percentile target for TTC statistics, in (0, 1].
    pub ttc_percentile: f64,
    pub bonepile: BonepileConfig,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        let mut pass_rules = BTreeMap::new();
        pass_rules.insert(
            "FCT".to_string(),
            vec![
                "675-24109-0010-TS2".to_string(),
                "675-24109-0020-TS2".to_string(),
            ],
        );
        Self {
            stations_order: ["FLA", "FLB", "AST", "FTS", "FCT", "RIN", "NVL"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pass_rules,
            timezone: "America/Los_Angeles".to_string(),
            aggregation: Granularity::Daily,
            tray_source: TraySource::Serial,
            top_k_errors: 5,
            ttc_thresholds_minutes: vec![5, 15, 60],
            ttc_percentile: 0.9,
            bonepile: BonepileConfig::default(),
        }
    }
}

impl AnalyticsConfig {
    /// Parse configuration from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults overlaid with `TRAYFLOW_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay `TRAYFLOW_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary variable source.
    ///
    /// Unparseable values leave the current setting in place; `validate`
    /// catches values that parse but are out of range.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tz) = lookup("TRAYFLOW_TIMEZONE") {
            self.timezone = tz;
        }
        if let Some(g) = lookup("TRAYFLOW_AGGREGATION").and_then(|s| s.parse().ok()) {
            self.aggregation = g;
        }
        if let Some(k) = lookup("TRAYFLOW_TOP_K_ERRORS").and_then(|s| s.parse().ok()) {
            self.top_k_errors = k;
        }
        if let Some(p) = lookup("TRAYFLOW_TTC_PERCENTILE").and_then(|s| s.parse().ok()) {
            self.ttc_percentile = p;
        }
        if let Some(order) = lookup("TRAYFLOW_STATIONS_ORDER") {
            let stations: Vec<String> = order
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !stations.is_empty() {
                self.stations_order = stations;
            }
        }
        if let Some(acc) = lookup("TRAYFLOW_BONEPILE_ACCUMULATE") {
            self.bonepile.accumulate = acc == "true" || acc == "1";
        }
        self
    }

    /// Load, overlay the environment and validate in one step.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_path(p)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn station_order(&self) -> StationOrder {
        StationOrder::new(&self.stations_order)
    }

    /// Reporting timezone.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "timezone".to_string(),
                value: self.timezone.clone(),
                reason: e.to_string(),
            })
    }

    /// Compiled serial-number pattern for disposition rows.
    pub fn sn_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.bonepile.sn_pattern).map_err(|e| ConfigError::InvalidValue {
            field: "bonepile.sn_pattern".to_string(),
            value: self.bonepile.sn_pattern.clone(),
            reason: e.to_string(),
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stations_order.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "stations_order".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for station in &self.stations_order {
            let key = normalize_key(station);
            if key.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "stations_order".to_string(),
                    value: station.clone(),
                    reason: "station names must not be empty".to_string(),
                });
            }
            if !seen.insert(key) {
                return Err(ConfigError::InvalidValue {
                    field: "stations_order".to_string(),
                    value: station.clone(),
                    reason: "duplicate station".to_string(),
                });
            }
        }

        self.tz()?;

        if self.top_k_errors == 0 {
            return Err(ConfigError::InvalidValue {
                field: "top_k_errors".to_string(),
                value: self.top_k_errors.to_string(),
                reason: "top_k_errors must be at least 1".to_string(),
            });
        }

        if !(self.ttc_percentile > 0.0 && self.ttc_percentile <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "ttc_percentile".to_string(),
                value: self.ttc_percentile.to_string(),
                reason: "ttc_percentile must be in (0, 1]".to_string(),
            });
        }

        if self
            .ttc_thresholds_minutes
            .windows(2)
            .any(|w| w[0] >= w[1])
        {
            return Err(ConfigError::InvalidValue {
                field: "ttc_thresholds_minutes".to_string(),
                value: format!("{:?}", self.ttc_thresholds_minutes),
                reason: "thresholds must be strictly ascending".to_string(),
            });
        }

        let order = self.station_order();
        let mut owner: HashMap<String, String> = HashMap::new();
        for (station, parts) in &self.pass_rules {
            if !order.is_ranked(station) {
                return Err(ConfigError::InvalidValue {
                    field: "pass_rules".to_string(),
                    value: station.clone(),
                    reason: "pass station is not in stations_order".to_string(),
                });
            }
            for part in parts {
                let key = normalize_key(part);
                if let Some(first) = owner.get(&key) {
                    if *first != normalize_key(station) {
                        return Err(ConfigError::DuplicatePassStation {
                            part_number: key,
                            first: first.clone(),
                            second: normalize_key(station),
                        });
                    }
                }
                owner.insert(key, normalize_key(station));
            }
        }

        self.sn_regex()?;

        for field in &self.bonepile.required_fields {
            if !DISPOSITION_FIELDS.contains(&field.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "bonepile.required_fields".to_string(),
                    value: field.clone(),
                    reason: format!("unknown field; expected one of {:?}", DISPOSITION_FIELDS),
                });
            }
        }
        if !self.bonepile.required_fields.iter().any(|f| f == "sn") {
            return Err(ConfigError::MissingRequired {
                field: "bonepile.required_fields.sn".to_string(),
            });
        }

        Ok(())
    }

    /// Part numbers seen in the batch that no pass rule covers.
    ///
    /// Empty and `UNKNOWN` part numbers are left out; they are missing data,
    /// not missing rules.
    pub fn unassigned_part_numbers<'a, I>(&self, observed: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let assigned: HashSet<String> = self
            .pass_rules
            .values()
            .flatten()
            .map(|p| normalize_key(p))
            .collect();
        let mut out: Vec<String> = observed
            .into_iter()
            .map(normalize_key)
            .filter(|p| !p.is_empty() && p != "UNKNOWN" && !assigned.contains(p))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
