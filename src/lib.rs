//! gossip-poison: a Rust library injecting model-poisoning attacks into gossip-style
//! decentralized learning. An adversarial node wraps its honest sharing component, decides per
//! outgoing message whether to corrupt the model update, applies the corruption, and keeps
//! per-node bookkeeping of how much poisoning took place.
//!
//! # Features
//! - Four corruption strategies (zero, flip, noise, scale) as pure buffer transformations.
//! - Per-message probability trigger with optional targeting, or a static adversary list
//!   poisoning on a round cadence.
//! - Poisoning metrics persisted every ten rounds and once on close.
//! - Async multi-node simulation with Tokio, and loaders for post-run evaluation.
//!
//! # Example
//! ```
//! use gossip_poison::{
//!     AttackType, HonestMessage, HonestSharing, MemorySink, PoisonConfig, PoisonError,
//!     PoisoningSharingController,
//! };
//!
//! struct Honest;
//!
//! impl HonestSharing for Honest {
//!     fn pre_step(&mut self) -> Result<(), PoisonError> {
//!         Ok(())
//!     }
//!
//!     fn serialize_round(&mut self) -> Result<Vec<HonestMessage>, PoisonError> {
//!         Ok(vec![HonestMessage { destination: 1, params: vec![0.5, -0.5] }])
//!     }
//! }
//!
//! # fn main() -> Result<(), PoisonError> {
//! let config = PoisonConfig::new(AttackType::Flip);
//! let mut node = PoisoningSharingController::new(0, &config, 2, Honest, MemorySink::new())?;
//! let messages = node.share_round()?;
//! assert_eq!(messages[0].params, vec![-0.5, 0.5]);
//! node.close()?;
//! # Ok(())
//! # }
//! ```

mod attack;
mod config;
mod decision;
mod error;
pub mod evaluation;
mod metrics;
mod sharing;
mod simulation;
mod types;

pub use attack::{apply_attack, AttackStrategy, AttackType, PoisonAttack};
pub use config::{
    derive_poisoned_config, AttackConfiguration, PoisonConfig, PoisonSettings, TriggerKind,
    POISON_SHARING_CLASS, SHARING_SECTION,
};
pub use decision::{
    CadencePolicy, DecisionContext, PoisoningPolicy, ProbabilityPolicy, TargetScope, TriggerPolicy,
};
pub use error::{PoisonError, Result};
pub use metrics::{
    metrics_file_name, JsonFileSink, MemorySink, MetricsRecorder, MetricsSink, PoisonMetrics,
    FLUSH_EVERY_ROUNDS,
};
pub use sharing::{ControllerPhase, HonestSharing, PoisoningSharingController};
pub use simulation::{InboxStats, Simulation, SimulationReport, StaticSharing, Topology};
pub use types::{HonestMessage, NodeId, OutgoingMessage, ParameterBuffer};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_attack_scenario_persists_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PoisonConfig::new(AttackType::Zero);
        config.poison_probability = 1.0;
        config.log_dir = dir.path().to_path_buf();

        let sharing = StaticSharing::new(vec![1, 2, 3, 4, 5], vec![0.3; 8]);
        let mut node = PoisoningSharingController::from_config(0, &config, 6, sharing).unwrap();
        for _ in 0..3 {
            let messages = node.share_round().unwrap();
            assert_eq!(messages.len(), 5);
            assert!(messages
                .iter()
                .all(|m| m.poisoned && m.real_node == 0 && m.params == vec![0.0; 8]));
        }
        // No periodic flush before round 10.
        assert!(!dir.path().join("poison_metrics_0.json").exists());
        node.close().unwrap();

        let loaded = evaluation::load_poison_metrics(dir.path()).unwrap();
        let metrics = &loaded[&0];
        assert_eq!(metrics.total_messages, 15);
        assert_eq!(metrics.poisoned_messages, 15);
        assert_eq!(metrics.rounds_poisoned, 3);
        assert_eq!(metrics.poison_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_scale_attack_with_zero_probability() {
        let mut config = PoisonConfig::new(AttackType::Scale);
        config.poison_strength = 2.0;
        config.poison_probability = 0.0;
        let topology = Topology::fully_connected(5);
        let mut simulation =
            Simulation::with_sinks(&topology, &config, 3, |_| MemorySink::new()).unwrap();
        let report = simulation.run(25).await.unwrap();
        assert_eq!(report.per_node.len(), 5);
        assert!(report.per_node.values().all(|m| m.poisoned_messages == 0));
        assert_eq!(report.delivered_poison_rate(), Some(0.0));
    }

    #[tokio::test]
    async fn test_probability_converges_across_rounds() {
        let mut config = PoisonConfig::new(AttackType::Noise);
        config.poison_probability = 0.25;
        config.poison_strength = 0.1;
        config.seed = Some(2024);
        let sharing = StaticSharing::new((1..=20).collect(), vec![1.0; 4]);
        let mut node =
            PoisoningSharingController::new(0, &config, 21, sharing, MemorySink::new()).unwrap();
        for _ in 0..1000 {
            node.share_round().unwrap();
        }
        let metrics = node.metrics();
        assert_eq!(metrics.total_messages, 20_000);
        let rate = metrics.poison_rate.unwrap();
        assert!((rate - 0.25).abs() < 0.02, "rate {rate}");
    }

    #[test]
    fn test_targeting_outside_graph_fails_before_any_round() {
        let mut config = PoisonConfig::new(AttackType::Zero);
        config.targeted_nodes = vec![3, 7];
        let topology = Topology::ring(5);
        assert!(matches!(
            Simulation::new(&topology, &config, 2),
            Err(PoisonError::NodeOutOfRange { node: 7, num_nodes: 5 })
        ));
    }

    #[test]
    fn test_config_file_roundtrip_to_controller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "[sharing]\nattack_type = \"scale\"\npoison_strength = 3.0\n\
             targeted_nodes = \"1\"\nseed = 9\n",
        )
        .unwrap();
        let config = PoisonConfig::from_file(&path).unwrap();
        let sharing = StaticSharing::new(vec![1, 2], vec![1.0, -1.0]);
        let mut node =
            PoisoningSharingController::new(0, &config, 3, sharing, MemorySink::new()).unwrap();
        let messages = node.share_round().unwrap();
        assert_eq!(messages[0].params, vec![3.0, -3.0]);
        assert!(messages[0].poisoned);
        assert_eq!(messages[1].params, vec![1.0, -1.0]);
        assert!(!messages[1].poisoned);
        assert_eq!(node.metrics().targeted_nodes, vec![1]);
    }
}
