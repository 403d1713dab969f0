use crate::types::NodeId;
use thiserror::Error;

/// Errors that can occur in the poisoning layer.
#[derive(Error, Debug)]
pub enum PoisonError {
    /// A configuration value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured attack name is not one of the supported strategies.
    #[error("unknown attack type: {0:?} (expected zero, flip, noise or scale)")]
    UnknownAttackType(String),

    /// A targeted or adversarial node id does not exist in the communication graph.
    #[error("node id {node} exceeds number of nodes in the graph ({num_nodes})")]
    NodeOutOfRange { node: NodeId, num_nodes: usize },

    /// A required configuration section is absent.
    #[error("config file missing [{0}] section")]
    MissingSection(String),

    /// The configuration document could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A derived configuration could not be written back out.
    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Metrics could not be encoded or decoded.
    #[error("metrics serialization error: {0}")]
    MetricsSerialize(#[from] serde_json::Error),

    /// Filesystem failure while persisting or loading.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A result table could not be read.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// The wrapped honest-sharing component failed to produce a round.
    #[error("honest sharing failed: {0}")]
    Sharing(String),

    /// A round was requested after the controller was closed.
    #[error("controller already closed")]
    Closed,

    /// Task execution failed.
    #[error("task execution failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PoisonError>;
