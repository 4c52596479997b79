//! Pass-rule engine.
//!
//! A part number passes overall only when its configured pass station shows a
//! PASS. Part numbers without a rule are reported, never defaulted.

use crate::timeline::StationOutcomes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use trayflow_core::{normalize_key, AnalyticsConfig, ConfigError, Outcome};

/// Result of looking up a part number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassStation {
    Station(String),
    NotConfigured,
}

/// Part numbers seen without a pass rule. Each appears once.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnassignedParts(BTreeSet<String>);

impl UnassignedParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a part number. Empty and `UNKNOWN` are missing data and skipped.
    pub fn record(&mut self, part_number: &str) {
        let key = normalize_key(part_number);
        if key.is_empty() || key == "UNKNOWN" {
            return;
        }
        self.0.insert(key);
    }

    pub fn contains(&self, part_number: &str) -> bool {
        self.0.contains(&normalize_key(part_number))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

/// Immutable part number → pass station table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassRuleTable {
    by_part: HashMap<String, String>,
}

impl PassRuleTable {
    /// Build from `station → [part numbers]` lists.
    ///
    /// Fails when a part number is listed under two different stations.
    pub fn new<I, S, P>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, P)>,
        S: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let mut by_part: HashMap<String, String> = HashMap::new();
        for (station, parts) in rules {
            let station = normalize_key(station.as_ref());
            for part in parts {
                let key = normalize_key(part.as_ref());
                if key.is_empty() {
                    continue;
                }
                if let Some(existing) = by_part.get(&key) {
                    if *existing != station {
                        return Err(ConfigError::DuplicatePassStation {
                            part_number: key,
                            first: existing.clone(),
                            second: station,
                        });
                    }
                }
                by_part.insert(key, station.clone());
            }
        }
        Ok(Self { by_part })
    }

    pub fn from_config(config: &AnalyticsConfig) -> Result<Self, ConfigError> {
        Self::new(config.pass_rules.iter().map(|(s, parts)| (s, parts.iter())))
    }

    pub fn resolve(&self, part_number: &str) -> PassStation {
        match self.by_part.get(&normalize_key(part_number)) {
            Some(station) => PassStation::Station(station.clone()),
            None => PassStation::NotConfigured,
        }
    }

    /// Whether a serial with this part number and these station outcomes passed.
    ///
    /// Unconfigured part numbers return false and are recorded in `unassigned`.
    pub fn is_passed(
        &self,
        part_number: &str,
        station_outcomes: &StationOutcomes,
        unassigned: &mut UnassignedParts,
    ) -> bool {
        match self.resolve(part_number) {
            PassStation::Station(station) => {
                station_outcomes.outcome_at(&station) == Some(Outcome::Pass)
            }
            PassStation::NotConfigured => {
                unassigned.record(part_number);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_part.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_part.is_empty()
    }
}
