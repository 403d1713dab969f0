use crate::{
    attack::{AttackType, PoisonAttack},
    decision::{CadencePolicy, ProbabilityPolicy, TargetScope, TriggerPolicy},
    error::Result,
    types::NodeId,
    PoisonError,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

/// Table holding the poisoning settings in a node-type config file.
pub const SHARING_SECTION: &str = "sharing";

/// `sharing_class` value selecting the poisoning wrapper.
pub const POISON_SHARING_CLASS: &str = "poison";

/// Which trigger decides when messages are poisoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Independent draw per message against `poison_probability`.
    #[default]
    Probability,
    /// Nodes in `adversarial_nodes` poison every `poison_after` rounds.
    Cadence,
}

/// Raw poisoning settings of the `[sharing]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoisonConfig {
    pub attack_type: String,
    #[serde(default = "default_one")]
    pub poison_strength: f64,
    #[serde(default = "default_one")]
    pub poison_probability: f64,
    #[serde(default, deserialize_with = "node_list")]
    pub targeted_nodes: Vec<NodeId>,
    #[serde(default)]
    pub target_scope: TargetScope,
    #[serde(default)]
    pub trigger: TriggerKind,
    #[serde(default, deserialize_with = "node_list")]
    pub adversarial_nodes: Vec<NodeId>,
    #[serde(default = "default_poison_after")]
    pub poison_after: u64,
    #[serde(default = "default_true")]
    pub log_poisoning_metrics: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_one() -> f64 {
    1.0
}

fn default_poison_after() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Accepts `[1, 2]` as well as the legacy `"1, 2"` form.
fn node_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<NodeId>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<NodeId>),
        Csv(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(ids) => Ok(ids),
        Raw::Csv(s) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<NodeId>()
                    .map_err(|e| serde::de::Error::custom(format!("bad node id {part:?}: {e}")))
            })
            .collect(),
    }
}

impl PoisonConfig {
    /// Settings for `attack_type` with every other field at its default.
    pub fn new(attack_type: AttackType) -> Self {
        Self {
            attack_type: attack_type.to_string(),
            poison_strength: default_one(),
            poison_probability: default_one(),
            targeted_nodes: Vec::new(),
            target_scope: TargetScope::default(),
            trigger: TriggerKind::default(),
            adversarial_nodes: Vec::new(),
            poison_after: default_poison_after(),
            log_poisoning_metrics: default_true(),
            log_dir: default_log_dir(),
            seed: None,
        }
    }

    /// Parses the `[sharing]` table of a TOML document.
    ///
    /// # Errors
    /// Returns an error if the document is malformed or has no `[sharing]` table.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut doc: toml::Table = s.parse()?;
        let section = doc
            .remove(SHARING_SECTION)
            .ok_or_else(|| PoisonError::MissingSection(SHARING_SECTION.into()))?;
        Ok(section.try_into()?)
    }

    /// Reads and parses a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Checks every field against a graph of `num_nodes` nodes.
    ///
    /// # Errors
    /// Returns the first invalid field found. A node must refuse to start on error.
    pub fn validate(&self, num_nodes: usize) -> Result<PoisonSettings> {
        let attack_type: AttackType = self.attack_type.parse()?;
        let attack = PoisonAttack::new(attack_type, self.poison_strength)?;

        for &node in self.targeted_nodes.iter().chain(&self.adversarial_nodes) {
            if node >= num_nodes {
                return Err(PoisonError::NodeOutOfRange { node, num_nodes });
            }
        }

        // Both policies are built so range errors surface whichever one is active.
        let probability = ProbabilityPolicy::new(
            self.poison_probability,
            self.targeted_nodes.iter().copied(),
            self.target_scope,
        )?;
        let cadence =
            CadencePolicy::new(self.adversarial_nodes.iter().copied(), self.poison_after)?;
        let policy = match self.trigger {
            TriggerKind::Probability => TriggerPolicy::Probability(probability),
            TriggerKind::Cadence => TriggerPolicy::Cadence(cadence),
        };

        Ok(PoisonSettings {
            attack: AttackConfiguration {
                attack,
                poison_probability: self.poison_probability,
                targeted_nodes: self.targeted_nodes.iter().copied().collect(),
                target_scope: self.target_scope,
            },
            policy,
            log_poisoning_metrics: self.log_poisoning_metrics,
            log_dir: self.log_dir.clone(),
            seed: self.seed,
        })
    }

    /// Nodes that run the poisoning wrapper under this config.
    ///
    /// Under the probability trigger with sender scope only targeted nodes attack;
    /// with destination scope every node does.
    pub fn attacking_nodes(&self, num_nodes: usize) -> BTreeSet<NodeId> {
        let declared = self.declared_adversaries();
        if self.trigger == TriggerKind::Probability && declared.is_empty() {
            (0..num_nodes).collect()
        } else {
            declared
        }
    }

    /// Adversaries the config names explicitly.
    ///
    /// Empty when the config only targets destinations, since then no node id identifies
    /// an attacker.
    pub fn declared_adversaries(&self) -> BTreeSet<NodeId> {
        match (self.trigger, self.target_scope) {
            (TriggerKind::Cadence, _) => self.adversarial_nodes.iter().copied().collect(),
            (TriggerKind::Probability, TargetScope::Sender) => {
                self.targeted_nodes.iter().copied().collect()
            }
            (TriggerKind::Probability, TargetScope::Destination) => BTreeSet::new(),
        }
    }
}

/// Immutable attack parameters of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct AttackConfiguration {
    pub attack: PoisonAttack,
    pub poison_probability: f64,
    pub targeted_nodes: BTreeSet<NodeId>,
    pub target_scope: TargetScope,
}

/// Validated settings a controller is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct PoisonSettings {
    pub attack: AttackConfiguration,
    pub policy: TriggerPolicy,
    pub log_poisoning_metrics: bool,
    pub log_dir: PathBuf,
    pub seed: Option<u64>,
}

/// Rewrites a base config so its `[sharing]` table selects the poisoning wrapper.
///
/// The previous `sharing_class` is kept under `honest_sharing_class`.
///
/// # Errors
/// Returns an error if `base` is malformed or lacks a `[sharing]` table.
pub fn derive_poisoned_config(base: &str, settings: &PoisonConfig) -> Result<String> {
    let mut doc: toml::Table = base.parse()?;
    let sharing = doc
        .get_mut(SHARING_SECTION)
        .and_then(toml::Value::as_table_mut)
        .ok_or_else(|| PoisonError::MissingSection(SHARING_SECTION.into()))?;

    if let Some(original) = sharing.remove("sharing_class") {
        sharing.insert("honest_sharing_class".into(), original);
    }
    sharing.insert(
        "sharing_class".into(),
        toml::Value::String(POISON_SHARING_CLASS.into()),
    );

    if let toml::Value::Table(fields) = toml::Value::try_from(settings)? {
        for (key, value) in fields {
            sharing.insert(key, value);
        }
    }

    Ok(toml::to_string(&doc)?)
}
