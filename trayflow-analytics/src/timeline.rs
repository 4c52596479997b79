//! Per-serial view of a row batch.
//!
//! Rows are ordered by `(test_time, batch position)`. When two rows share a
//! serial and a station, the later one in that order wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use trayflow_core::{AnnotatedRow, Outcome, StationOrder, TestRow, Timestamp, TraySource};

/// Winning observation at one station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationOutcome {
    pub station: String,
    pub outcome: Outcome,
    pub test_time: Timestamp,
    /// Position of the winning row in the batch.
    pub row_index: usize,
}

/// Last recorded outcome per station, in canonical station order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StationOutcomes {
    entries: Vec<StationOutcome>,
}

impl StationOutcomes {
    /// Build from `(batch position, row)` pairs of a single serial.
    pub fn from_rows<'a, I>(rows: I, order: &StationOrder) -> Self
    where
        I: IntoIterator<Item = (usize, &'a TestRow)>,
    {
        let mut latest: BTreeMap<String, StationOutcome> = BTreeMap::new();
        for (idx, row) in rows {
            let station = row.station_key();
            let candidate = StationOutcome {
                station: station.clone(),
                outcome: row.outcome,
                test_time: row.test_time,
                row_index: idx,
            };
            let replace = latest.get(&station).map_or(true, |current| {
                (current.test_time, current.row_index) <= (candidate.test_time, candidate.row_index)
            });
            if replace {
                latest.insert(station, candidate);
            }
        }
        let mut entries: Vec<StationOutcome> = latest.into_values().collect();
        entries.sort_by(|a, b| order.compare(&a.station, &b.station));
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StationOutcome> {
        self.entries.iter()
    }

    pub fn winning(&self, station: &str) -> Option<&StationOutcome> {
        let key = trayflow_core::normalize_key(station);
        self.entries.iter().find(|e| e.station == key)
    }

    pub fn outcome_at(&self, station: &str) -> Option<Outcome> {
        self.winning(station).map(|e| e.outcome)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All rows of one serial number, chronologically ordered.
#[derive(Debug, Clone)]
pub struct SerialTimeline<'a> {
    pub serial_number: String,
    /// `(batch position, row)` sorted by `(test_time, position)`.
    pub rows: Vec<(usize, &'a AnnotatedRow)>,
    pub station_outcomes: StationOutcomes,
}

impl<'a> SerialTimeline<'a> {
    fn new(serial_number: String, mut rows: Vec<(usize, &'a AnnotatedRow)>, order: &StationOrder) -> Self {
        rows.sort_by(|(ia, a), (ib, b)| (a.row.test_time, *ia).cmp(&(b.row.test_time, *ib)));
        let station_outcomes = StationOutcomes::from_rows(rows.iter().map(|(i, r)| (*i, &r.row)), order);
        Self {
            serial_number,
            rows,
            station_outcomes,
        }
    }

    /// Latest observation of the serial. Timelines are never empty.
    pub fn latest(&self) -> (usize, &'a AnnotatedRow) {
        self.rows[self.rows.len() - 1]
    }

    pub fn latest_row(&self) -> &'a TestRow {
        &self.latest().1.row
    }

    /// A serial is bonepile if any of its rows is.
    pub fn is_bonepile(&self) -> bool {
        self.rows.iter().any(|(_, r)| r.is_bonepile)
    }

    /// Stations in visiting order, consecutive repeats collapsed.
    pub fn path(&self) -> Vec<String> {
        let mut path: Vec<String> = Vec::new();
        for (_, r) in &self.rows {
            let station = r.row.station_key();
            if path.last() != Some(&station) {
                path.push(station);
            }
        }
        path
    }

    pub fn tray(&self, source: TraySource) -> Option<String> {
        match source {
            TraySource::Serial => Some(self.serial_number.clone()),
            TraySource::RowMetadata => self
                .rows
                .iter()
                .rev()
                .find_map(|(_, r)| r.row.tray_key().map(str::to_string)),
        }
    }

    /// Failure message of the most recent failing row.
    pub fn last_failure_msg(&self) -> Option<String> {
        self.rows
            .iter()
            .rev()
            .filter(|(_, r)| r.row.outcome == Outcome::Fail)
            .find_map(|(_, r)| {
                r.row
                    .failure_msg
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
            })
    }
}

/// Serial timelines keyed by serial number, plus the count of rows without one.
#[derive(Debug, Clone)]
pub struct Timelines<'a> {
    pub serials: BTreeMap<String, SerialTimeline<'a>>,
    pub skipped_rows: u64,
}

/// Partition a batch by serial number.
pub fn group_by_serial<'a>(rows: &'a [AnnotatedRow], order: &StationOrder) -> Timelines<'a> {
    let mut grouped: BTreeMap<String, Vec<(usize, &'a AnnotatedRow)>> = BTreeMap::new();
    let mut skipped_rows = 0u64;
    for (idx, row) in rows.iter().enumerate() {
        let serial = row.row.serial_key();
        if serial.is_empty() {
            skipped_rows += 1;
            continue;
        }
        grouped.entry(serial.to_string()).or_default().push((idx, row));
    }
    let serials = grouped
        .into_iter()
        .map(|(sn, rows)| {
            let timeline = SerialTimeline::new(sn.clone(), rows, order);
            (sn, timeline)
        })
        .collect();
    Timelines {
        serials,
        skipped_rows,
    }
}
