use crate::{
    attack::AttackStrategy,
    config::{AttackConfiguration, PoisonConfig, PoisonSettings},
    decision::{DecisionContext, PoisoningPolicy, TriggerPolicy},
    error::Result,
    metrics::{JsonFileSink, MetricsRecorder, MetricsSink, PoisonMetrics},
    types::{HonestMessage, NodeId, OutgoingMessage},
    PoisonError,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, trace};

/// Trait for the honest model-sharing component a poisoning node wraps.
///
/// Implementors produce the messages an honest node would send this round.
pub trait HonestSharing: Send {
    /// Prepares the round (e.g. snapshots the local model).
    fn pre_step(&mut self) -> Result<()>;

    /// Serializes this round's outgoing updates, one per destination.
    fn serialize_round(&mut self) -> Result<Vec<HonestMessage>>;
}

impl<T: HonestSharing + ?Sized> HonestSharing for &mut T {
    fn pre_step(&mut self) -> Result<()> {
        (**self).pre_step()
    }

    fn serialize_round(&mut self) -> Result<Vec<HonestMessage>> {
        (**self).serialize_round()
    }
}

impl<T: HonestSharing + ?Sized> HonestSharing for Box<T> {
    fn pre_step(&mut self) -> Result<()> {
        (**self).pre_step()
    }

    fn serialize_round(&mut self) -> Result<Vec<HonestMessage>> {
        (**self).serialize_round()
    }
}

/// Where a controller is within one sharing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    AwaitingStep,
    Serializing,
    Deciding,
    Annotating,
    Recorded,
}

impl ControllerPhase {
    /// Phase that follows `self` in a successful cycle.
    pub fn next(self) -> Self {
        match self {
            Self::AwaitingStep => Self::Serializing,
            Self::Serializing => Self::Deciding,
            Self::Deciding => Self::Annotating,
            Self::Annotating => Self::Recorded,
            Self::Recorded => Self::AwaitingStep,
        }
    }
}

/// Wraps an honest sharing component and corrupts its output when the policy fires.
pub struct PoisoningSharingController<H: HonestSharing, S: MetricsSink = JsonFileSink> {
    /// Identity of this node.
    uid: NodeId,

    /// Wrapped honest component.
    honest: H,

    /// Attack applied to poisoned messages.
    attack: AttackConfiguration,

    /// Trigger deciding which messages are poisoned.
    policy: TriggerPolicy,

    /// Node-local randomness for decisions and noise.
    rng: ChaCha8Rng,

    /// Poisoning counters.
    recorder: MetricsRecorder<S>,

    /// Completed sharing cycles.
    round: u64,

    phase: ControllerPhase,

    closed: bool,
}

impl<H: HonestSharing> PoisoningSharingController<H, JsonFileSink> {
    /// Creates a controller persisting metrics under the configured `log_dir`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid for a graph of `num_nodes` nodes.
    pub fn from_config(
        uid: NodeId,
        config: &PoisonConfig,
        num_nodes: usize,
        honest: H,
    ) -> Result<Self> {
        let sink = JsonFileSink::new(config.log_dir.clone());
        Self::new(uid, config, num_nodes, honest, sink)
    }
}

impl<H: HonestSharing, S: MetricsSink> PoisoningSharingController<H, S> {
    /// Creates a controller for node `uid`.
    ///
    /// # Arguments
    /// * `uid` - Identity of this node.
    /// * `config` - Raw poisoning settings, validated here.
    /// * `num_nodes` - Size of the communication graph.
    /// * `honest` - Honest sharing component to wrap.
    /// * `sink` - Destination of metrics snapshots.
    ///
    /// # Errors
    /// Returns an error if `uid` or any configured node id is not in the graph, or if
    /// any setting is out of range. No round can run on a misconfigured node.
    pub fn new(
        uid: NodeId,
        config: &PoisonConfig,
        num_nodes: usize,
        honest: H,
        sink: S,
    ) -> Result<Self> {
        if uid >= num_nodes {
            return Err(PoisonError::NodeOutOfRange {
                node: uid,
                num_nodes,
            });
        }
        let settings = config.validate(num_nodes)?;
        Ok(Self::with_settings(uid, settings, honest, sink))
    }

    /// Creates a controller from already validated settings.
    pub fn with_settings(uid: NodeId, settings: PoisonSettings, honest: H, sink: S) -> Self {
        let rng = match settings.seed {
            Some(seed) => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(uid as u64);
                rng
            }
            None => ChaCha8Rng::from_entropy(),
        };
        let targeted: Vec<NodeId> = settings.attack.targeted_nodes.iter().copied().collect();
        let recorder = MetricsRecorder::new(uid, targeted, sink, settings.log_poisoning_metrics);

        info!(
            uid,
            attack = %settings.attack.attack.attack_type(),
            strength = settings.attack.attack.strength(),
            policy = settings.policy.name(),
            "poisoning sharing initialized"
        );

        Self {
            uid,
            honest,
            attack: settings.attack,
            policy: settings.policy,
            rng,
            recorder,
            round: 0,
            phase: ControllerPhase::AwaitingStep,
            closed: false,
        }
    }

    /// Runs one sharing cycle and returns the messages to deliver.
    ///
    /// # Errors
    /// Returns [`PoisonError::Closed`] after [`close`](Self::close), or the honest
    /// component's error. A failed cycle records nothing and does not advance the round.
    pub fn share_round(&mut self) -> Result<Vec<OutgoingMessage>> {
        if self.closed {
            return Err(PoisonError::Closed);
        }
        match self.run_cycle() {
            Ok(messages) => Ok(messages),
            Err(e) => {
                self.phase = ControllerPhase::AwaitingStep;
                Err(e)
            }
        }
    }

    fn run_cycle(&mut self) -> Result<Vec<OutgoingMessage>> {
        self.advance();
        self.honest.pre_step()?;
        let honest = self.honest.serialize_round()?;

        self.advance();
        let decisions: Vec<bool> = honest
            .iter()
            .map(|message| {
                let ctx = DecisionContext {
                    uid: self.uid,
                    round: self.round,
                    destination: message.destination,
                };
                self.policy.should_poison(&ctx, &mut self.rng)
            })
            .collect();

        self.advance();
        let mut outgoing = Vec::with_capacity(honest.len());
        for (message, &poisoned) in honest.into_iter().zip(&decisions) {
            if !poisoned {
                outgoing.push(OutgoingMessage::honest(message, self.uid));
                continue;
            }
            let params = self.attack.attack.apply(&message.params, &mut self.rng)?;
            debug!(
                uid = self.uid,
                round = self.round,
                destination = message.destination,
                "poisoned outgoing update"
            );
            outgoing.push(OutgoingMessage {
                destination: message.destination,
                params,
                real_node: self.uid,
                poisoned: true,
            });
        }

        self.advance();
        self.recorder.record_round(&decisions);
        self.recorder.end_of_round();
        self.round += 1;

        self.advance();
        Ok(outgoing)
    }

    fn advance(&mut self) {
        let next = self.phase.next();
        trace!(uid = self.uid, from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }

    /// Writes the final metrics snapshot. Only the first call has any effect.
    ///
    /// # Errors
    /// Returns the sink error of the final flush.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!(
            uid = self.uid,
            rounds = self.round,
            poisoned = self.recorder.metrics().poisoned_messages,
            "closing poisoning sharing"
        );
        self.recorder.flush()
    }

    /// Id of the node this controller runs on.
    pub fn uid(&self) -> NodeId {
        self.uid
    }

    /// Completed sharing cycles.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Where the controller is in its sharing cycle.
    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    /// Whether [`Self::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Poisoning counters so far.
    pub fn metrics(&self) -> &PoisonMetrics {
        self.recorder.metrics()
    }

    /// Attack parameters in force.
    pub fn attack(&self) -> &AttackConfiguration {
        &self.attack
    }

    /// Sink receiving metrics snapshots.
    pub fn sink(&self) -> &S {
        self.recorder.sink()
    }

    /// Wrapped honest sharing component.
    pub fn honest(&self) -> &H {
        &self.honest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attack::AttackType, config::TriggerKind, decision::TargetScope, metrics::MemorySink,
    };

    /// Honest component sending `[1, 2, 3]` to each destination.
    struct FixedSharing {
        destinations: Vec<NodeId>,
        pre_steps: usize,
        fail_next: bool,
    }

    impl FixedSharing {
        fn new(destinations: Vec<NodeId>) -> Self {
            Self {
                destinations,
                pre_steps: 0,
                fail_next: false,
            }
        }
    }

    impl HonestSharing for FixedSharing {
        fn pre_step(&mut self) -> Result<()> {
            self.pre_steps += 1;
            Ok(())
        }

        fn serialize_round(&mut self) -> Result<Vec<HonestMessage>> {
            if std::mem::take(&mut self.fail_next) {
                return Err(PoisonError::Sharing("model not ready".into()));
            }
            Ok(self
                .destinations
                .iter()
                .map(|&destination| HonestMessage {
                    destination,
                    params: vec![1.0, 2.0, 3.0],
                })
                .collect())
        }
    }

    fn config(attack: AttackType) -> PoisonConfig {
        let mut config = PoisonConfig::new(attack);
        config.seed = Some(11);
        config
    }

    #[test]
    fn test_zero_attack_poisons_everything() {
        let mut controller = PoisoningSharingController::new(
            0,
            &config(AttackType::Zero),
            8,
            FixedSharing::new(vec![1, 2, 3, 4, 5]),
            MemorySink::new(),
        )
        .unwrap();
        for _ in 0..3 {
            let messages = controller.share_round().unwrap();
            assert_eq!(messages.len(), 5);
            for message in &messages {
                assert!(message.poisoned);
                assert_eq!(message.real_node, 0);
                assert_eq!(message.params, vec![0.0; 3]);
            }
        }
        controller.close().unwrap();
        let metrics = controller.sink().latest(0).unwrap();
        assert_eq!(metrics.total_messages, 15);
        assert_eq!(metrics.poisoned_messages, 15);
        assert_eq!(metrics.rounds_poisoned, 3);
        assert_eq!(metrics.poison_rate, Some(1.0));
        assert_eq!(controller.honest().pre_steps, 3);
    }

    #[test]
    fn test_zero_probability_never_poisons() {
        let mut config = config(AttackType::Scale);
        config.poison_strength = 2.0;
        config.poison_probability = 0.0;
        let mut controller = PoisoningSharingController::new(
            1,
            &config,
            4,
            FixedSharing::new(vec![0, 2, 3]),
            MemorySink::new(),
        )
        .unwrap();
        for _ in 0..40 {
            for message in controller.share_round().unwrap() {
                assert!(!message.poisoned);
                assert_eq!(message.params, vec![1.0, 2.0, 3.0]);
                assert_eq!(message.real_node, 1);
            }
        }
        assert_eq!(controller.metrics().poisoned_messages, 0);
        assert_eq!(controller.metrics().total_messages, 120);
        // Periodic flushes at rounds 10, 20, 30 and 40.
        assert_eq!(controller.sink().flush_count(1), 4);
    }

    #[test]
    fn test_targeted_destinations_only() {
        let mut config = config(AttackType::Flip);
        config.targeted_nodes = vec![3, 7];
        let mut controller = PoisoningSharingController::new(
            0,
            &config,
            10,
            FixedSharing::new((1..10).collect()),
            MemorySink::new(),
        )
        .unwrap();
        for message in controller.share_round().unwrap() {
            let targeted = message.destination == 3 || message.destination == 7;
            assert_eq!(message.poisoned, targeted);
            if targeted {
                assert_eq!(message.params, vec![-1.0, -2.0, -3.0]);
            }
        }
    }

    #[test]
    fn test_sender_scope_spares_untargeted_node() {
        let mut config = config(AttackType::Zero);
        config.targeted_nodes = vec![3, 7];
        config.target_scope = TargetScope::Sender;
        let mut controller = PoisoningSharingController::new(
            2,
            &config,
            10,
            FixedSharing::new(vec![3, 7]),
            MemorySink::new(),
        )
        .unwrap();
        assert!(controller.share_round().unwrap().iter().all(|m| !m.poisoned));
    }

    #[test]
    fn test_cadence_trigger() {
        let mut config = config(AttackType::Scale);
        config.trigger = TriggerKind::Cadence;
        config.adversarial_nodes = vec![2];
        config.poison_after = 2;
        config.poison_strength = 3.0;
        let mut controller = PoisoningSharingController::new(
            2,
            &config,
            4,
            FixedSharing::new(vec![0, 1]),
            MemorySink::new(),
        )
        .unwrap();
        let poisoned_rounds: Vec<bool> = (0..4)
            .map(|_| controller.share_round().unwrap().iter().all(|m| m.poisoned))
            .collect();
        assert_eq!(poisoned_rounds, vec![true, false, true, false]);
        assert_eq!(controller.metrics().poisoned_messages, 4);
    }

    #[test]
    fn test_construction_rejects_unknown_nodes() {
        let mut config = config(AttackType::Zero);
        config.targeted_nodes = vec![5];
        let result = PoisoningSharingController::new(
            0,
            &config,
            5,
            FixedSharing::new(vec![1]),
            MemorySink::new(),
        );
        assert!(matches!(result, Err(PoisonError::NodeOutOfRange { node: 5, .. })));

        let result = PoisoningSharingController::new(
            6,
            &PoisonConfig::new(AttackType::Zero),
            5,
            FixedSharing::new(vec![1]),
            MemorySink::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_round_records_nothing() {
        let mut sharing = FixedSharing::new(vec![1, 2]);
        sharing.fail_next = true;
        let mut controller = PoisoningSharingController::new(
            0,
            &config(AttackType::Zero),
            3,
            sharing,
            MemorySink::new(),
        )
        .unwrap();
        assert!(matches!(controller.share_round(), Err(PoisonError::Sharing(_))));
        assert_eq!(controller.round(), 0);
        assert_eq!(controller.phase(), ControllerPhase::AwaitingStep);
        assert_eq!(controller.metrics().total_messages, 0);

        controller.share_round().unwrap();
        assert_eq!(controller.round(), 1);
        assert_eq!(controller.metrics().total_messages, 2);
    }

    #[test]
    fn test_close_once() {
        let mut controller = PoisoningSharingController::new(
            0,
            &config(AttackType::Zero),
            3,
            FixedSharing::new(vec![1]),
            MemorySink::new(),
        )
        .unwrap();
        controller.share_round().unwrap();
        controller.close().unwrap();
        controller.close().unwrap();
        assert_eq!(controller.sink().flush_count(0), 1);
        assert!(matches!(controller.share_round(), Err(PoisonError::Closed)));
    }

    #[test]
    fn test_borrowed_honest_sharing() {
        let mut sharing = FixedSharing::new(vec![1]);
        {
            let mut controller = PoisoningSharingController::new(
                0,
                &config(AttackType::Zero),
                2,
                &mut sharing,
                MemorySink::new(),
            )
            .unwrap();
            controller.share_round().unwrap();
        }
        assert_eq!(sharing.pre_steps, 1);
    }

    #[test]
    fn test_phase_cycle() {
        let mut phase = ControllerPhase::AwaitingStep;
        for _ in 0..5 {
            phase = phase.next();
        }
        assert_eq!(phase, ControllerPhase::AwaitingStep);
    }
}
