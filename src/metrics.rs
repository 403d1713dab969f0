use crate::{error::Result, types::NodeId};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Number of completed rounds between two periodic flushes.
pub const FLUSH_EVERY_ROUNDS: u64 = 10;

/// Poisoning bookkeeping of one node, in the layout the evaluation tooling reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoisonMetrics {
    pub total_messages: u64,
    pub poisoned_messages: u64,
    pub rounds_poisoned: u64,
    /// `poisoned_messages / total_messages`; absent until a message has been recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poison_rate: Option<f64>,
    #[serde(default)]
    pub targeted_nodes: Vec<NodeId>,
}

impl PoisonMetrics {
    /// Fresh counters for a node attacking `targeted_nodes`.
    pub fn new(targeted_nodes: Vec<NodeId>) -> Self {
        Self {
            targeted_nodes,
            ..Self::default()
        }
    }

    /// Derived poisoning rate, `None` while no message has been seen.
    pub fn current_rate(&self) -> Option<f64> {
        (self.total_messages > 0)
            .then(|| self.poisoned_messages as f64 / self.total_messages as f64)
    }
}

/// Trait for durable destinations of metrics snapshots.
pub trait MetricsSink: Send {
    /// Stores the latest snapshot for `uid`, replacing any previous one.
    fn persist(&mut self, uid: NodeId, metrics: &PoisonMetrics) -> Result<()>;
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn persist(&mut self, uid: NodeId, metrics: &PoisonMetrics) -> Result<()> {
        (**self).persist(uid, metrics)
    }
}

/// File name the evaluation tooling expects for `uid`.
pub fn metrics_file_name(uid: NodeId) -> String {
    format!("poison_metrics_{uid}.json")
}

/// Writes one pretty-printed JSON file per node into a log directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    log_dir: PathBuf,
}

impl JsonFileSink {
    /// Sink writing snapshots into `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// Path of the snapshot written for `uid`.
    pub fn path_for(&self, uid: NodeId) -> PathBuf {
        self.log_dir.join(metrics_file_name(uid))
    }

    /// Directory snapshots are written to.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl MetricsSink for JsonFileSink {
    fn persist(&mut self, uid: NodeId, metrics: &PoisonMetrics) -> Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        let path = self.path_for(uid);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(metrics)?;
        fs::write(&tmp, body)?;
        // Readers never observe a half-written snapshot.
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Keeps every snapshot in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    snapshots: BTreeMap<NodeId, Vec<PoisonMetrics>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent snapshot for `uid`.
    pub fn latest(&self, uid: NodeId) -> Option<&PoisonMetrics> {
        self.snapshots.get(&uid).and_then(|s| s.last())
    }

    /// Number of snapshots persisted for `uid`.
    pub fn flush_count(&self, uid: NodeId) -> usize {
        self.snapshots.get(&uid).map_or(0, Vec::len)
    }
}

impl MetricsSink for MemorySink {
    fn persist(&mut self, uid: NodeId, metrics: &PoisonMetrics) -> Result<()> {
        self.snapshots.entry(uid).or_default().push(metrics.clone());
        Ok(())
    }
}

/// Accumulates a node's poisoning counters and persists them periodically.
pub struct MetricsRecorder<S: MetricsSink> {
    uid: NodeId,
    metrics: PoisonMetrics,
    sink: S,
    persist_enabled: bool,
    /// Set when the last flush attempt failed and must be retried.
    pending_flush: bool,
}

impl<S: MetricsSink> MetricsRecorder<S> {
    /// Creates a recorder for node `uid`.
    ///
    /// # Arguments
    /// * `uid` - Node whose messages are counted; keys the persisted snapshot.
    /// * `targeted_nodes` - Copied into every snapshot.
    /// * `sink` - Destination of snapshots.
    /// * `persist_enabled` - When false, [`flush`](Self::flush) only derives `poison_rate`.
    pub fn new(uid: NodeId, targeted_nodes: Vec<NodeId>, sink: S, persist_enabled: bool) -> Self {
        Self {
            uid,
            metrics: PoisonMetrics::new(targeted_nodes),
            sink,
            persist_enabled,
            pending_flush: false,
        }
    }

    /// Counts one outgoing message.
    pub fn record(&mut self, poisoned: bool) {
        self.metrics.total_messages += 1;
        if poisoned {
            self.metrics.poisoned_messages += 1;
        }
    }

    /// Counts every decision of one round.
    pub fn record_round(&mut self, decisions: &[bool]) {
        for &poisoned in decisions {
            self.record(poisoned);
        }
    }

    /// Closes a round; flushes on every [`FLUSH_EVERY_ROUNDS`]-th call.
    ///
    /// A failed flush is logged and retried at the next boundary; it never
    /// fails the round.
    pub fn end_of_round(&mut self) {
        self.metrics.rounds_poisoned += 1;
        if self.metrics.rounds_poisoned % FLUSH_EVERY_ROUNDS != 0 {
            return;
        }
        if let Err(e) = self.flush() {
            warn!(
                uid = self.uid,
                round = self.metrics.rounds_poisoned,
                error = %e,
                "poison metrics flush failed, retrying at next boundary"
            );
        }
    }

    /// Derives `poison_rate` and persists a snapshot.
    ///
    /// Counters are never modified here.
    ///
    /// # Errors
    /// Returns the sink error; the snapshot stays pending.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(rate) = self.metrics.current_rate() {
            self.metrics.poison_rate = Some(rate);
        }
        if !self.persist_enabled {
            return Ok(());
        }
        match self.sink.persist(self.uid, &self.metrics) {
            Ok(()) => {
                self.pending_flush = false;
                debug!(
                    uid = self.uid,
                    total = self.metrics.total_messages,
                    poisoned = self.metrics.poisoned_messages,
                    "poison metrics persisted"
                );
                Ok(())
            }
            Err(e) => {
                self.pending_flush = true;
                Err(e)
            }
        }
    }

    /// Current counters.
    pub fn metrics(&self) -> &PoisonMetrics {
        &self.metrics
    }

    /// Whether the last flush attempt failed.
    pub fn has_pending_flush(&self) -> bool {
        self.pending_flush
    }

    /// Sink receiving snapshots.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Node the counters belong to.
    pub fn uid(&self) -> NodeId {
        self.uid
    }
}
