use crate::{error::Result, types::NodeId, PoisonError};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a policy knows about one outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionContext {
    /// Identity of the sending node.
    pub uid: NodeId,

    /// Number of rounds completed before this one.
    pub round: u64,

    /// Peer the message is addressed to.
    pub destination: NodeId,
}

/// Trait for deciding whether an outgoing message gets poisoned.
///
/// Implementors see one message at a time and may draw from the node-local RNG.
pub trait PoisoningPolicy: Send + Sync {
    /// Returns true if the message described by `ctx` must be corrupted.
    fn should_poison(&self, ctx: &DecisionContext, rng: &mut dyn RngCore) -> bool;
}

/// Which identity the `targeted_nodes` set is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetScope {
    /// Only messages addressed to a targeted peer are attacked.
    #[default]
    Destination,
    /// Only a node whose own uid is targeted attacks.
    Sender,
}

/// Per-message Bernoulli poisoning, optionally restricted to a set of node ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityPolicy {
    probability: f64,
    targeted_nodes: BTreeSet<NodeId>,
    scope: TargetScope,
}

impl ProbabilityPolicy {
    /// Creates a probability policy.
    ///
    /// # Arguments
    /// * `probability` - Chance that an in-scope message is poisoned (0 ≤ p ≤ 1).
    /// * `targeted_nodes` - Ids the attack is restricted to; empty means every peer.
    /// * `scope` - Whether ids are matched against the destination or the sender.
    ///
    /// # Errors
    /// Returns an error if `probability` is not in [0, 1].
    pub fn new(
        probability: f64,
        targeted_nodes: impl IntoIterator<Item = NodeId>,
        scope: TargetScope,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(PoisonError::InvalidConfig(format!(
                "poison_probability must be in [0, 1], got {probability}"
            )));
        }
        Ok(Self {
            probability,
            targeted_nodes: targeted_nodes.into_iter().collect(),
            scope,
        })
    }

    fn in_scope(&self, ctx: &DecisionContext) -> bool {
        if self.targeted_nodes.is_empty() {
            return true;
        }
        let id = match self.scope {
            TargetScope::Destination => ctx.destination,
            TargetScope::Sender => ctx.uid,
        };
        self.targeted_nodes.contains(&id)
    }
}

impl PoisoningPolicy for ProbabilityPolicy {
    fn should_poison(&self, ctx: &DecisionContext, rng: &mut dyn RngCore) -> bool {
        // Out-of-scope messages do not consume a draw.
        if !self.in_scope(ctx) {
            return false;
        }
        rng.gen::<f64>() < self.probability
    }
}

/// Static adversary list poisoning every `period` rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct CadencePolicy {
    adversarial_nodes: BTreeSet<NodeId>,
    period: u64,
}

impl CadencePolicy {
    /// Creates a cadence policy.
    ///
    /// # Errors
    /// Returns an error if `period` is zero.
    pub fn new(adversarial_nodes: impl IntoIterator<Item = NodeId>, period: u64) -> Result<Self> {
        if period == 0 {
            return Err(PoisonError::InvalidConfig(
                "poison_after must be at least 1".into(),
            ));
        }
        Ok(Self {
            adversarial_nodes: adversarial_nodes.into_iter().collect(),
            period,
        })
    }
}

impl PoisoningPolicy for CadencePolicy {
    fn should_poison(&self, ctx: &DecisionContext, _rng: &mut dyn RngCore) -> bool {
        self.adversarial_nodes.contains(&ctx.uid) && ctx.round % self.period == 0
    }
}

/// The single trigger active for a deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerPolicy {
    Probability(ProbabilityPolicy),
    Cadence(CadencePolicy),
}

impl TriggerPolicy {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Probability(_) => "probability",
            Self::Cadence(_) => "cadence",
        }
    }
}

impl PoisoningPolicy for TriggerPolicy {
    fn should_poison(&self, ctx: &DecisionContext, rng: &mut dyn RngCore) -> bool {
        match self {
            Self::Probability(p) => p.should_poison(ctx, rng),
            Self::Cadence(c) => c.should_poison(ctx, rng),
        }
    }
}
