//! Canonical station ordering.

use crate::normalize_key;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Prefix the upstream system puts on re-test stations.
pub const RETEST_PREFIX: &str = "R_";

/// Fixed, ordered list of test stations.
///
/// Stations not in the list are unranked and sort after every ranked station,
/// in lexical order among themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct StationOrder {
    stations: Vec<String>,
    ranks: HashMap<String, usize>,
}

impl From<Vec<String>> for StationOrder {
    fn from(stations: Vec<String>) -> Self {
        StationOrder::new(stations)
    }
}

impl From<StationOrder> for Vec<String> {
    fn from(order: StationOrder) -> Self {
        order.stations
    }
}

impl StationOrder {
    pub fn new<I, S>(stations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ordered = Vec::new();
        let mut ranks = HashMap::new();
        for s in stations {
            let key = normalize_key(s.as_ref());
            if key.is_empty() || ranks.contains_key(&key) {
                continue;
            }
            ranks.insert(key.clone(), ordered.len());
            ordered.push(key);
        }
        Self {
            stations: ordered,
            ranks,
        }
    }

    pub fn stations(&self) -> &[String] {
        &self.stations
    }

    /// Position of a station in the canonical order.
    pub fn rank(&self, station: &str) -> Option<usize> {
        self.ranks.get(&normalize_key(station)).copied()
    }

    pub fn is_ranked(&self, station: &str) -> bool {
        self.rank(station).is_some()
    }

    /// Total order over station names: ranked by position, then unranked by name.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match (self.rank(a), self.rank(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => normalize_key(a).cmp(&normalize_key(b)),
        }
    }

    /// Sort station names in canonical order, in place.
    pub fn sort(&self, stations: &mut [String]) {
        stations.sort_by(|a, b| self.compare(a, b));
    }
}

/// Station group: the station name without its re-test prefix.
pub fn station_group(station: &str) -> String {
    let key = normalize_key(station);
    match key.strip_prefix(RETEST_PREFIX) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> StationOrder {
        StationOrder::new(["FLA", "FLB", "AST", "FTS", "FCT", "RIN", "NVL"])
    }

    #[test]
    fn test_rank_is_case_insensitive() {
        let o = order();
        assert_eq!(o.rank("fla"), Some(0));
        assert_eq!(o.rank("NVL"), Some(6));
        assert_eq!(o.rank("XYZ"), None);
    }

    #[test]
    fn test_unranked_sort_after_ranked() {
        let o = order();
        let mut s = vec![
            "ZZZ".to_string(),
            "FCT".to_string(),
            "ABC".to_string(),
            "FLA".to_string(),
        ];
        o.sort(&mut s);
        assert_eq!(s, vec!["FLA", "FCT", "ABC", "ZZZ"]);
    }

    #[test]
    fn test_duplicates_ignored() {
        let o = StationOrder::new(["FLA", "fla", "FCT"]);
        assert_eq!(o.stations(), &["FLA".to_string(), "FCT".to_string()]);
    }

    #[test]
    fn test_serde_rebuilds_ranks() {
        let json = serde_json::to_string(&order()).unwrap();
        assert!(json.starts_with("[\"FLA\""));
        let back: StationOrder = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rank("FCT"), Some(4));
    }

    #[test]
    fn test_station_group_strips_retest_prefix() {
        assert_eq!(station_group("R_FCT"), "FCT");
        assert_eq!(station_group("r_fct"), "FCT");
        assert_eq!(station_group("FCT"), "FCT");
        assert_eq!(station_group("R_"), "R_");
    }
}
