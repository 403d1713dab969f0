//! Best-effort loading of result files written during poisoned and baseline runs.
//!
//! Unreadable or malformed files are skipped with a warning; every summary is
//! computed over whatever loaded and yields `None` when nothing did.

use crate::{error::Result, metrics::PoisonMetrics, types::NodeId};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
};
use tracing::warn;

const RESULTS_SUFFIX: &str = "_results.csv";
const METRICS_PREFIX: &str = "poison_metrics_";
const METRICS_SUFFIX: &str = ".json";

/// One row of a `<node_id>_results.csv` file.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub node_id: NodeId,
    pub iteration: u64,
    pub test_acc: Option<f64>,
    pub test_loss: Option<f64>,
    pub train_loss: Option<f64>,
    /// Round duration without evaluation, from `total_round_time_no_eval`.
    pub round_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    iteration: u64,
    #[serde(default)]
    test_acc: Option<f64>,
    #[serde(default)]
    test_loss: Option<f64>,
    #[serde(default)]
    train_loss: Option<f64>,
    #[serde(default, rename = "total_round_time_no_eval")]
    round_time: Option<f64>,
}

/// Column of a result table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    TestAcc,
    TestLoss,
    TrainLoss,
}

impl Metric {
    fn of(self, row: &ResultRow) -> Option<f64> {
        match self {
            Self::TestAcc => row.test_acc,
            Self::TestLoss => row.test_loss,
            Self::TrainLoss => row.train_loss,
        }
    }
}

fn files_matching(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(stem) = name.strip_prefix(prefix).and_then(|n| n.strip_suffix(suffix)) {
            let stem = stem.to_string();
            files.push((path, stem));
        }
    }
    files.sort();
    Ok(files)
}

fn read_results_file(path: &Path, node_id: NodeId) -> Result<Vec<ResultRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<CsvRow>() {
        let raw = match record {
            Ok(raw) => raw,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                let line = e.position().map(|p| p.line());
                warn!(
                    path = %path.display(),
                    line = ?line,
                    error = %e,
                    "skipping malformed results row"
                );
                continue;
            }
        };
        rows.push(ResultRow {
            node_id,
            iteration: raw.iteration,
            test_acc: raw.test_acc,
            test_loss: raw.test_loss,
            train_loss: raw.train_loss,
            round_time: raw.round_time,
        });
    }
    Ok(rows)
}

fn read_metrics_file(path: &Path) -> Result<PoisonMetrics> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

/// Loads every `<node_id>_results.csv` in `dir`.
///
/// Rows that fail to parse are skipped individually; the rest of their file still loads.
///
/// # Errors
/// Only fails if `dir` itself cannot be listed.
pub fn load_results(dir: impl AsRef<Path>) -> Result<Vec<ResultRow>> {
    let mut rows = Vec::new();
    for (path, stem) in files_matching(dir.as_ref(), "", RESULTS_SUFFIX)? {
        let Ok(node_id) = stem.parse::<NodeId>() else {
            warn!(path = %path.display(), "skipping results file without numeric node id");
            continue;
        };
        match read_results_file(&path, node_id) {
            Ok(loaded) => rows.extend(loaded),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed results file"),
        }
    }
    Ok(rows)
}

/// Loads every `poison_metrics_<uid>.json` in `dir`.
///
/// # Errors
/// Only fails if `dir` itself cannot be listed.
pub fn load_poison_metrics(dir: impl AsRef<Path>) -> Result<BTreeMap<NodeId, PoisonMetrics>> {
    let mut metrics = BTreeMap::new();
    for (path, stem) in files_matching(dir.as_ref(), METRICS_PREFIX, METRICS_SUFFIX)? {
        let Ok(uid) = stem.parse::<NodeId>() else {
            warn!(path = %path.display(), "skipping metrics file without numeric node id");
            continue;
        };
        match read_metrics_file(&path) {
            Ok(m) => {
                metrics.insert(uid, m);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed metrics file"),
        }
    }
    Ok(metrics)
}

/// Summary of one metric at one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl IterationStats {
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std: var.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            count: values.len(),
        })
    }
}

/// Per-iteration statistics of `metric`, ignoring nodes in `exclude`.
///
/// Iterations where no remaining node reported `metric` are left out.
pub fn per_iteration_stats(
    rows: &[ResultRow],
    metric: Metric,
    exclude: &BTreeSet<NodeId>,
) -> BTreeMap<u64, IterationStats> {
    let mut values: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
    for row in rows.iter().filter(|r| !exclude.contains(&r.node_id)) {
        if let Some(v) = metric.of(row).filter(|v| !v.is_nan()) {
            values.entry(row.iteration).or_default().push(v);
        }
    }
    values
        .into_iter()
        .filter_map(|(iteration, vs)| IterationStats::from_values(&vs).map(|s| (iteration, s)))
        .collect()
}

/// Mean test accuracy at the last evaluated iteration, over nodes not in `exclude`.
pub fn final_accuracy(rows: &[ResultRow], exclude: &BTreeSet<NodeId>) -> Option<f64> {
    per_iteration_stats(rows, Metric::TestAcc, exclude)
        .into_iter()
        .next_back()
        .map(|(_, stats)| stats.mean)
}

/// Summed round time over nodes not in `exclude`, `None` if no row reports it.
pub fn total_round_time(rows: &[ResultRow], exclude: &BTreeSet<NodeId>) -> Option<f64> {
    rows.iter()
        .filter(|r| !exclude.contains(&r.node_id))
        .filter_map(|r| r.round_time)
        .fold(None, |acc, t| Some(acc.unwrap_or(0.0) + t))
}

/// Accuracy impact of an attack compared with a baseline run.
#[derive(Debug, Clone, PartialEq)]
pub struct AttackImpact {
    pub attack_type: String,
    pub baseline_final: Option<f64>,
    pub poisoned_final: Option<f64>,
    pub baseline_time: Option<f64>,
    pub poisoned_time: Option<f64>,
}

impl AttackImpact {
    /// Compares both runs, ignoring nodes in `exclude` (typically the adversaries).
    pub fn compare(
        attack_type: impl Into<String>,
        baseline: &[ResultRow],
        poisoned: &[ResultRow],
        exclude: &BTreeSet<NodeId>,
    ) -> Self {
        Self {
            attack_type: attack_type.into(),
            baseline_final: final_accuracy(baseline, exclude),
            poisoned_final: final_accuracy(poisoned, exclude),
            baseline_time: total_round_time(baseline, exclude),
            poisoned_time: total_round_time(poisoned, exclude),
        }
    }

    /// Extra seconds the poisoned run spent in its rounds.
    pub fn time_impact(&self) -> Option<f64> {
        Some(self.poisoned_time? - self.baseline_time?)
    }

    /// `poisoned - baseline` final accuracy.
    pub fn impact(&self) -> Option<f64> {
        Some(self.poisoned_final? - self.baseline_final?)
    }

    /// Impact as a percentage of the baseline; `None` for a zero baseline.
    pub fn relative_change(&self) -> Option<f64> {
        let baseline = self.baseline_final?;
        if baseline == 0.0 {
            return None;
        }
        Some(self.impact()? / baseline * 100.0)
    }
}

impl fmt::Display for AttackImpact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Attack Impact Summary ({}) ===", self.attack_type)?;
        let (Some(baseline), Some(poisoned)) = (self.baseline_final, self.poisoned_final) else {
            return writeln!(f, "no data");
        };
        writeln!(f, "Final baseline accuracy: {baseline:.4}")?;
        writeln!(f, "Final poisoned accuracy: {poisoned:.4}")?;
        writeln!(f, "Accuracy impact: {:.4}", poisoned - baseline)?;
        match self.relative_change() {
            Some(rel) => writeln!(f, "Relative accuracy change: {rel:.2}%")?,
            None => writeln!(f, "Relative accuracy change: undefined (zero baseline)")?,
        }
        if let Some(dt) = self.time_impact() {
            writeln!(f, "Time impact: {dt:.2}s")?;
        }
        Ok(())
    }
}
