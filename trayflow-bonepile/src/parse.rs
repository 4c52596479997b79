//! Disposition workbook parser.
//!
//! Every sheet not on the ignore list is a disposition category. Sheets whose
//! content hash matches the previous snapshot are reused instead of parsed.
//! Row problems are counted and never fail the parse; only a workbook with no
//! usable sheets does.

use crate::cells::{mmdd_entries, normalize_sn};
use crate::workbook::{Sheet, Workbook};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use trayflow_core::{
    content_hash_hex, normalize_key, BonepileConfig, ConfigError, ParseFailure, Timestamp,
    Warning, DISPOSITION_FIELDS, REQUIRED_DISPOSITION_COLUMNS,
};

/// Header aliases per field, first match wins.
const HEADER_ALIASES: [(&str, &[&str]); 7] = [
    ("sn", &["SN"]),
    ("nv_disposition", &["NV DISPOSITION", "NV DISPO"]),
    ("status", &["STATUS"]),
    ("pic", &["PIC"]),
    ("igs_action", &["IGS ACTION"]),
    ("igs_status", &["IGS STATUS"]),
    ("nvpn", &["NVPN", "PART NUMBER", "PART NUMBERS", "SKU"]),
];

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// One row of a disposition sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionEntry {
    /// Sheet the row came from.
    pub category: String,
    /// 1-based row number as shown in Excel.
    pub excel_row: usize,
    pub sn: String,
    pub nvpn: String,
    pub status: String,
    pub pic: String,
    pub igs_status: String,
    pub nv_disposition: String,
    pub igs_action: String,
    pub nv_dispo_count: usize,
    pub igs_action_count: usize,
    pub parsed_at: Timestamp,
}

/// A row skipped by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub sheet: String,
    pub excel_row: usize,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SheetState {
    Ok { header_row: usize },
    /// Content hash matched the previous snapshot; entries were reused.
    Unchanged,
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetStatus {
    pub sheet: String,
    pub content_hash: String,
    pub state: SheetState,
    pub rows: usize,
    pub errors: usize,
}

impl SheetStatus {
    pub fn is_error(&self) -> bool {
        matches!(self.state, SheetState::Error { .. })
    }
}

/// Result of one successful workbook parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionParseResult {
    /// SHA-256 over every sheet name and content hash, hex.
    pub upload_id: String,
    pub parsed_at: Timestamp,
    /// Entries in workbook order.
    pub entries: Vec<DispositionEntry>,
    /// Serial → category; the last sheet in workbook order wins.
    pub categories: BTreeMap<String, String>,
    /// Serials per category, counted on the final serial → category map.
    pub category_counts: BTreeMap<String, u64>,
    pub rows_applied: u64,
    pub error_count: u64,
    pub sheets: Vec<SheetStatus>,
    pub issues: Vec<RowIssue>,
    pub ignored_sheets: Vec<String>,
}

impl DispositionParseResult {
    pub fn serials(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn sheet_status(&self, sheet: &str) -> Option<&SheetStatus> {
        self.sheets.iter().find(|s| s.sheet == sheet)
    }

    pub fn warnings(&self) -> Vec<Warning> {
        let mut warnings = Vec::new();
        if self.error_count > 0 {
            warnings.push(Warning::RowValidation {
                count: self.error_count,
            });
        }
        let failed: Vec<String> = self
            .sheets
            .iter()
            .filter(|s| s.is_error())
            .map(|s| s.sheet.clone())
            .collect();
        if !failed.is_empty() {
            warnings.push(Warning::SheetErrors { sheets: failed });
        }
        warnings
    }
}

// ============================================================================
// PARSER
// ============================================================================

/// Field → 0-based column index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ColumnMap(BTreeMap<&'static str, usize>);

impl ColumnMap {
    fn from_header(header: &[String]) -> Self {
        let index: BTreeMap<String, usize> = header
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.trim().is_empty())
            .map(|(i, h)| (normalize_key(h), i))
            .rev()
            .collect();
        let mut map = BTreeMap::new();
        for (field, aliases) in HEADER_ALIASES {
            if let Some(col) = aliases.iter().find_map(|a| index.get(*a)) {
                map.insert(field, *col);
            }
        }
        Self(map)
    }

    fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_DISPOSITION_COLUMNS
            .iter()
            .copied()
            .filter(|f| !self.0.contains_key(f))
            .collect()
    }

    fn cell<'r>(&self, row: &'r [String], field: &str) -> &'r str {
        self.0
            .get(field)
            .and_then(|i| row.get(*i))
            .map(|s| s.trim())
            .unwrap_or("")
    }
}

/// Parser settings resolved from [`BonepileConfig`].
#[derive(Debug, Clone)]
pub struct SheetParser {
    config: BonepileConfig,
    sn_pattern: Regex,
}

struct SheetParse {
    status: SheetStatus,
    entries: Vec<DispositionEntry>,
    issues: Vec<RowIssue>,
}

impl SheetParser {
    pub fn new(config: &BonepileConfig) -> Result<Self, ConfigError> {
        let sn_pattern = Regex::new(&config.sn_pattern).map_err(|e| ConfigError::InvalidValue {
            field: "bonepile.sn_pattern".to_string(),
            value: config.sn_pattern.clone(),
            reason: e.to_string(),
        })?;
        for field in &config.required_fields {
            if !DISPOSITION_FIELDS.contains(&field.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "bonepile.required_fields".to_string(),
                    value: field.clone(),
                    reason: "unknown disposition field".to_string(),
                });
            }
        }
        Ok(Self {
            config: config.clone(),
            sn_pattern,
        })
    }

    /// Parse a workbook, reusing unchanged sheets from `previous`.
    pub fn parse(
        &self,
        workbook: &Workbook,
        previous: Option<&DispositionParseResult>,
        parsed_at: Timestamp,
    ) -> Result<DispositionParseResult, ParseFailure> {
        if workbook.sheets.is_empty() {
            return Err(ParseFailure::NoSheets);
        }
        let (ignored, targets): (Vec<&Sheet>, Vec<&Sheet>) = workbook
            .sheets
            .iter()
            .partition(|s| self.config.is_ignored_sheet(&s.name));
        let ignored_sheets: Vec<String> = ignored.iter().map(|s| s.name.clone()).collect();
        if targets.is_empty() {
            return Err(ParseFailure::NoDispositionSheets {
                ignored: ignored_sheets,
            });
        }

        let mut upload = Sha256::new();
        let mut entries = Vec::new();
        let mut issues = Vec::new();
        let mut sheets = Vec::new();

        for sheet in &workbook.sheets {
            let hash = content_hash_hex(&sheet.content_hash());
            upload.update(sheet.name.as_bytes());
            upload.update(b"\0");
            upload.update(hash.as_bytes());
            if self.config.is_ignored_sheet(&sheet.name) {
                continue;
            }

            let reused = previous.and_then(|prev| Self::reuse(prev, &sheet.name, &hash));
            let parsed = match reused {
                Some(parsed) => parsed,
                None => self.parse_sheet(sheet, hash, parsed_at),
            };
            tracing::debug!(
                sheet = %sheet.name,
                state = ?parsed.status.state,
                rows = parsed.status.rows,
                errors = parsed.status.errors,
                "Disposition sheet processed"
            );
            entries.extend(parsed.entries);
            issues.extend(parsed.issues);
            sheets.push(parsed.status);
        }

        let mut categories = BTreeMap::new();
        for e in &entries {
            categories.insert(e.sn.clone(), e.category.clone());
        }
        let mut category_counts: BTreeMap<String, u64> = BTreeMap::new();
        for category in categories.values() {
            *category_counts.entry(category.clone()).or_default() += 1;
        }

        Ok(DispositionParseResult {
            upload_id: hex::encode(upload.finalize()),
            parsed_at,
            rows_applied: entries.len() as u64,
            error_count: sheets.iter().map(|s| s.errors as u64).sum(),
            entries,
            categories,
            category_counts,
            sheets,
            issues,
            ignored_sheets,
        })
    }

    fn reuse(prev: &DispositionParseResult, sheet: &str, hash: &str) -> Option<SheetParse> {
        let status = prev.sheet_status(sheet)?;
        if status.content_hash != hash || status.is_error() {
            return None;
        }
        let entries: Vec<DispositionEntry> = prev
            .entries
            .iter()
            .filter(|e| e.category == sheet)
            .cloned()
            .collect();
        Some(SheetParse {
            status: SheetStatus {
                sheet: sheet.to_string(),
                content_hash: hash.to_string(),
                state: SheetState::Unchanged,
                rows: entries.len(),
                errors: status.errors,
            },
            entries,
            issues: Vec::new(),
        })
    }

    fn sheet_error(sheet: &Sheet, hash: String, reason: String) -> SheetParse {
        SheetParse {
            status: SheetStatus {
                sheet: sheet.name.clone(),
                content_hash: hash,
                state: SheetState::Error { reason },
                rows: 0,
                errors: 0,
            },
            entries: Vec::new(),
            issues: Vec::new(),
        }
    }

    fn parse_sheet(&self, sheet: &Sheet, hash: String, parsed_at: Timestamp) -> SheetParse {
        let header_idx = sheet
            .rows
            .iter()
            .take(self.config.header_scan_rows)
            .position(|row| row.iter().any(|c| normalize_key(c) == "SN"));
        let Some(header_idx) = header_idx else {
            return Self::sheet_error(sheet, hash, "header row not found (SN)".to_string());
        };

        let columns = ColumnMap::from_header(&sheet.rows[header_idx]);
        let missing = columns.missing_required();
        if !missing.is_empty() {
            return Self::sheet_error(sheet, hash, format!("missing columns: {}", missing.join(", ")));
        }

        let mut entries = Vec::new();
        let mut issues = Vec::new();
        let mut blank_run = 0usize;
        for (offset, row) in sheet.rows.iter().enumerate().skip(header_idx + 1) {
            let excel_row = offset + 1;
            if row.iter().all(|c| c.trim().is_empty()) {
                blank_run += 1;
                if blank_run >= self.config.max_blank_run {
                    break;
                }
                continue;
            }
            blank_run = 0;

            let issue = |field: &str, reason: &str| RowIssue {
                sheet: sheet.name.clone(),
                excel_row,
                field: field.to_string(),
                reason: reason.to_string(),
            };
            if let Some(field) = self
                .config
                .required_fields
                .iter()
                .find(|f| columns.cell(row, f).is_empty())
            {
                issues.push(issue(field, "missing value"));
                continue;
            }
            let raw_sn = columns.cell(row, "sn");
            let Some(sn) = normalize_sn(raw_sn, &self.sn_pattern) else {
                issues.push(issue("sn", &format!("invalid serial number '{raw_sn}'")));
                continue;
            };

            let nv_disposition = columns.cell(row, "nv_disposition").to_string();
            let igs_action = columns.cell(row, "igs_action").to_string();
            entries.push(DispositionEntry {
                category: sheet.name.clone(),
                excel_row,
                sn,
                nvpn: columns.cell(row, "nvpn").to_string(),
                status: columns.cell(row, "status").to_string(),
                pic: columns.cell(row, "pic").to_string(),
                igs_status: columns.cell(row, "igs_status").to_string(),
                nv_dispo_count: mmdd_entries(&nv_disposition).len(),
                igs_action_count: mmdd_entries(&igs_action).len(),
                nv_disposition,
                igs_action,
                parsed_at,
            });
        }

        SheetParse {
            status: SheetStatus {
                sheet: sheet.name.clone(),
                content_hash: hash,
                state: SheetState::Ok {
                    header_row: header_idx + 1,
                },
                rows: entries.len(),
                errors: issues.len(),
            },
            entries,
            issues,
        }
    }
}

/// Parse a workbook with the given settings.
pub fn parse_workbook(
    workbook: &Workbook,
    config: &BonepileConfig,
    previous: Option<&DispositionParseResult>,
    parsed_at: Timestamp,
) -> trayflow_core::TrayflowResult<DispositionParseResult> {
    let parser = SheetParser::new(config)?;
    Ok(parser.parse(workbook, previous, parsed_at)?)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const HEADER: [&str; 7] = [
        "SN",
        "NVPN",
        "STATUS",
        "PIC",
        "NV Disposition",
        "IGS Action",
        "IGS Status",
    ];

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn sheet(name: &str, rows: &[[&str; 7]]) -> Sheet {
        let mut s = Sheet::new(name).with_row(["Bonepile tracker"]).with_row(HEADER);
        for r in rows {
            s = s.with_row(*r);
        }
        s
    }

    fn parser() -> SheetParser {
        SheetParser::new(&BonepileConfig::default()).unwrap()
    }

    #[test]
    fn test_header_detection_and_aliases() {
        let wb = Workbook::new().with_sheet(sheet(
            "Hold",
            &[["1812345678901", "P-1", "FAIL", "IGS", "3/02 swap", "3/04 done", "open"]],
        ));
        let r = parser().parse(&wb, None, now()).unwrap();
        assert_eq!(r.entries.len(), 1);
        let e = &r.entries[0];
        assert_eq!(e.excel_row, 3);
        assert_eq!(e.nvpn, "P-1");
        assert_eq!(e.nv_dispo_count, 1);
        assert_eq!(r.sheets[0].state, SheetState::Ok { header_row: 2 });
        assert_eq!(r.categories["1812345678901"], "Hold");
    }

    #[test]
    fn test_missing_sn_counts_as_validation_error() {
        let wb = Workbook::new().with_sheet(sheet(
            "Hold",
            &[
                ["1812345678901", "P-1", "FAIL", "IGS", "", "", ""],
                ["", "P-1", "FAIL", "IGS", "3/02", "", ""],
                ["1812345678902", "P-1", "FAIL", "IGS", "", "", ""],
            ],
        ));
        let r = parser().parse(&wb, None, now()).unwrap();
        assert_eq!(r.rows_applied, 2);
        assert_eq!(r.error_count, 1);
        assert_eq!(r.issues[0].excel_row, 4);
        assert!(r.warnings().iter().any(|w| matches!(w, Warning::RowValidation { count: 1 })));
    }

    #[test]
    fn test_blank_run_ends_sheet() {
        let mut cfg = BonepileConfig::default();
        cfg.max_blank_run = 2;
        let mut s = sheet("Hold", &[["1812345678901", "", "", "", "", "", ""]]);
        s = s.with_row([""]).with_row(["", ""]);
        s = s.with_row(["1812345678902"]);
        let wb = Workbook::new().with_sheet(s);
        let r = SheetParser::new(&cfg).unwrap().parse(&wb, None, now()).unwrap();
        assert_eq!(r.rows_applied, 1);
        assert_eq!(r.error_count, 0);
    }

    #[test]
    fn test_sheet_errors_are_not_fatal() {
        let bad = Sheet::new("Broken").with_row(["no header here"]);
        let missing_cols = Sheet::new("Partial").with_row(["SN", "STATUS"]);
        let wb = Workbook::new()
            .with_sheet(bad)
            .with_sheet(missing_cols)
            .with_sheet(sheet("Hold", &[["1812345678901", "", "", "", "", "", ""]]));
        let r = parser().parse(&wb, None, now()).unwrap();
        assert_eq!(r.rows_applied, 1);
        assert!(r.sheets[0].is_error());
        assert!(matches!(&r.sheets[1].state, SheetState::Error { reason } if reason.contains("pic")));
        assert!(r
            .warnings()
            .iter()
            .any(|w| matches!(w, Warning::SheetErrors { sheets } if sheets.len() == 2)));
    }

    #[test]
    fn test_structural_failures() {
        assert_eq!(parser().parse(&Workbook::new(), None, now()), Err(ParseFailure::NoSheets));
        let wb = Workbook::new().with_sheet(Sheet::new("Summary"));
        assert!(matches!(
            parser().parse(&wb, None, now()),
            Err(ParseFailure::NoDispositionSheets { .. })
        ));
    }

    #[test]
    fn test_unchanged_sheets_are_reused() {
        let hold = sheet("Hold", &[["1812345678901", "", "FAIL", "IGS", "", "", ""]]);
        let scrap = sheet("Scrap", &[["1812345678902", "", "FAIL", "IGS", "", "", ""]]);
        let first = parser()
            .parse(&Workbook::new().with_sheet(hold.clone()).with_sheet(scrap), None, now())
            .unwrap();

        let scrap2 = sheet(
            "Scrap",
            &[
                ["1812345678902", "", "FAIL", "IGS", "", "", ""],
                ["1812345678903", "", "FAIL", "IGS", "", "", ""],
            ],
        );
        let later = now() + chrono::Duration::hours(1);
        let second = parser()
            .parse(&Workbook::new().with_sheet(hold).with_sheet(scrap2), Some(&first), later)
            .unwrap();
        assert_eq!(second.sheets[0].state, SheetState::Unchanged);
        assert!(matches!(second.sheets[1].state, SheetState::Ok { .. }));
        assert_eq!(second.rows_applied, 3);
        assert_eq!(second.entries[0].parsed_at, now());
        assert_ne!(first.upload_id, second.upload_id);
    }

    #[test]
    fn test_last_sheet_wins_category() {
        let wb = Workbook::new()
            .with_sheet(sheet("Hold", &[["1812345678901", "", "", "", "", "", ""]]))
            .with_sheet(sheet("Scrap", &[["1812345678901", "", "", "", "", "", ""]]));
        let r = parser().parse(&wb, None, now()).unwrap();
        assert_eq!(r.categories["1812345678901"], "Scrap");
        assert_eq!(r.category_counts.get("Scrap"), Some(&1));
        assert_eq!(r.category_counts.get("Hold"), None);
    }

    #[test]
    fn test_unknown_required_field_rejected() {
        let mut cfg = BonepileConfig::default();
        cfg.required_fields.push("owner".to_string());
        assert!(SheetParser::new(&cfg).is_err());
    }
}
