//! Time-to-close statistics helpers.

use serde::{Deserialize, Serialize};

/// Label used for events or serials that never closed.
pub const OPEN_BUCKET: &str = "open";

/// Nearest-rank percentile of an ascending sample.
///
/// `rank = ceil(p * n)`, value = `sorted[rank - 1]`. Returns `None` on an
/// empty sample. `p` is clamped to (0, 1].
pub fn nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(f64::MIN_POSITIVE, 1.0);
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[idx])
}

/// Sort a sample so percentiles do not depend on input order.
pub fn sorted_sample(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

/// Round to two decimals for presentation.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Median, mean and configured percentile of a sample, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DistributionStats {
    pub count: u64,
    pub median: Option<f64>,
    pub mean: Option<f64>,
    pub percentile: Option<f64>,
    pub max: Option<f64>,
}

impl DistributionStats {
    pub fn from_sample(values: Vec<f64>, p: f64) -> Self {
        let sorted = sorted_sample(values);
        if sorted.is_empty() {
            return Self::default();
        }
        let sum: f64 = sorted.iter().sum();
        Self {
            count: sorted.len() as u64,
            median: nearest_rank(&sorted, 0.5).map(round2),
            mean: Some(round2(sum / sorted.len() as f64)),
            percentile: nearest_rank(&sorted, p).map(round2),
            max: sorted.last().copied().map(round2),
        }
    }
}

/// Histogram of durations over ascending minute thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtcBuckets {
    thresholds: Vec<u32>,
    labels: Vec<String>,
}

impl TtcBuckets {
    /// `[5, 15, 60]` gives `<=5m`, `5-15m`, `15-60m`, `>60m`.
    pub fn new(thresholds: &[u32]) -> Self {
        let mut labels = Vec::with_capacity(thresholds.len() + 1);
        if thresholds.is_empty() {
            labels.push("all".to_string());
        } else {
            labels.push(format!("<={}m", thresholds[0]));
            for w in thresholds.windows(2) {
                labels.push(format!("{}-{}m", w[0], w[1]));
            }
            labels.push(format!(">{}m", thresholds[thresholds.len() - 1]));
        }
        Self {
            thresholds: thresholds.to_vec(),
            labels,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Bucket index of a duration in minutes.
    pub fn index_of(&self, minutes: f64) -> usize {
        self.thresholds
            .iter()
            .position(|t| minutes <= *t as f64)
            .unwrap_or(self.thresholds.len())
    }

    pub fn label_of(&self, minutes: f64) -> &str {
        &self.labels[self.index_of(minutes)]
    }
}
