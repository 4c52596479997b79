//! Cell-level helpers for disposition sheets.
//!
//! Disposition cells are free text that accumulate `mm/dd` stamped notes,
//! e.g. `"3/02 reseat GPU 3/05 swap HBM"`. Serial numbers arrive as text or
//! as numbers Excel may have rendered in scientific notation.

use once_cell::sync::Lazy;
use regex::Regex;

static MMDD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})\b").expect("static regex"));
static SCIENTIFIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+(\.\d+)?E\+\d+$").expect("static regex"));
static TRAILING_ZERO: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.0$").expect("static regex"));

/// Normalize a raw serial-number cell.
///
/// Undoes scientific notation and a trailing `.0`, keeps digits only, then
/// checks the result against `pattern`.
pub fn normalize_sn(raw: &str, pattern: &Regex) -> Option<String> {
    let mut s = raw.trim().to_string();
    if s.is_empty() {
        return None;
    }
    if SCIENTIFIC.is_match(&s) {
        if let Ok(v) = s.parse::<f64>() {
            s = format!("{v:.0}");
        }
    }
    if TRAILING_ZERO.is_match(&s) {
        s.truncate(s.len() - 2);
    }
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    pattern.is_match(&digits).then_some(digits)
}

/// Split a cell into segments, each starting at an `mm/dd` marker.
pub fn mmdd_entries(text: &str) -> Vec<&str> {
    let starts: Vec<usize> = MMDD.find_iter(text).map(|m| m.start()).collect();
    starts
        .iter()
        .enumerate()
        .map(|(i, start)| {
            let end = starts.get(i + 1).copied().unwrap_or(text.len());
            text[*start..end].trim()
        })
        .filter(|seg| !seg.is_empty())
        .collect()
}

/// `(month, day)` of the last `mm/dd` marker, if it is a plausible date.
pub fn last_mmdd(text: &str) -> Option<(u32, u32)> {
    let caps = MMDD.captures_iter(text).last()?;
    let month: u32 = caps.get(1)?.as_str().parse().ok()?;
    let day: u32 = caps.get(2)?.as_str().parse().ok()?;
    ((1..=12).contains(&month) && (1..=31).contains(&day)).then_some((month, day))
}

/// Last stamped segment, or the whole trimmed text when nothing is stamped.
pub fn last_mmdd_entry(text: &str) -> String {
    match mmdd_entries(text).last() {
        Some(seg) => seg.to_string(),
        None => text.trim().to_string(),
    }
}

/// `PASS`, `ALL PASS`, `PASSED` and friends.
pub fn is_pass_status(status: &str) -> bool {
    status.to_uppercase().contains("PASS")
}
