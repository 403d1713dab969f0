use crate::{
    config::PoisonConfig,
    error::Result,
    metrics::{JsonFileSink, MetricsSink, PoisonMetrics},
    sharing::{HonestSharing, PoisoningSharingController},
    types::{HonestMessage, NodeId, OutgoingMessage, ParameterBuffer},
    PoisonError,
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc::{self, Sender};
use tracing::info;

/// Who talks to whom in a simulated gossip graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    neighbours: Vec<Vec<NodeId>>,
}

impl Topology {
    /// Ring where every node talks to its two adjacent nodes.
    pub fn ring(num_nodes: usize) -> Self {
        let neighbours = (0..num_nodes)
            .map(|id| {
                let adjacent = [(id + num_nodes - 1) % num_nodes, (id + 1) % num_nodes];
                let set: BTreeSet<NodeId> =
                    adjacent.into_iter().filter(|&peer| peer != id).collect();
                set.into_iter().collect()
            })
            .collect();
        Self { neighbours }
    }

    /// Every node talks to every other node.
    pub fn fully_connected(num_nodes: usize) -> Self {
        let neighbours = (0..num_nodes)
            .map(|id| (0..num_nodes).filter(|&peer| peer != id).collect())
            .collect();
        Self { neighbours }
    }

    /// Builds a topology from explicit neighbour lists.
    ///
    /// # Errors
    /// Returns an error on self-loops or ids outside the graph.
    pub fn from_adjacency(neighbours: Vec<Vec<NodeId>>) -> Result<Self> {
        let num_nodes = neighbours.len();
        for (id, peers) in neighbours.iter().enumerate() {
            for &peer in peers {
                if peer >= num_nodes {
                    return Err(PoisonError::NodeOutOfRange {
                        node: peer,
                        num_nodes,
                    });
                }
                if peer == id {
                    return Err(PoisonError::InvalidConfig(format!(
                        "node {id} lists itself as a peer"
                    )));
                }
            }
        }
        Ok(Self { neighbours })
    }

    /// Number of nodes in the graph.
    pub fn num_nodes(&self) -> usize {
        self.neighbours.len()
    }

    /// Peers `id` sends to, empty for an unknown id.
    pub fn neighbours(&self, id: NodeId) -> &[NodeId] {
        self.neighbours.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Honest sharing stand-in: the same fixed-shape update to every neighbour.
#[derive(Debug, Clone)]
pub struct StaticSharing {
    neighbours: Vec<NodeId>,
    params: ParameterBuffer,
    steps: u64,
}

impl StaticSharing {
    /// Sends `params` to each of `neighbours` every round.
    pub fn new(neighbours: Vec<NodeId>, params: ParameterBuffer) -> Self {
        Self {
            neighbours,
            params,
            steps: 0,
        }
    }

    /// Number of `pre_step` calls seen.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl HonestSharing for StaticSharing {
    fn pre_step(&mut self) -> Result<()> {
        self.steps += 1;
        Ok(())
    }

    fn serialize_round(&mut self) -> Result<Vec<HonestMessage>> {
        Ok(self
            .neighbours
            .iter()
            .map(|&destination| HonestMessage {
                destination,
                params: self.params.clone(),
            })
            .collect())
    }
}

/// A simulated participant.
enum SimNode<S: MetricsSink> {
    Honest { uid: NodeId, sharing: StaticSharing },
    Poisoning(Box<PoisoningSharingController<StaticSharing, S>>),
}

impl<S: MetricsSink> SimNode<S> {
    fn share_round(&mut self) -> Result<Vec<OutgoingMessage>> {
        match self {
            Self::Honest { uid, sharing } => {
                sharing.pre_step()?;
                let uid = *uid;
                Ok(sharing
                    .serialize_round()?
                    .into_iter()
                    .map(|m| OutgoingMessage::honest(m, uid))
                    .collect())
            }
            Self::Poisoning(controller) => controller.share_round(),
        }
    }

    /// Runs `rounds` cycles, then closes the node even if a round failed.
    ///
    /// The first failure wins: a round or transport error is returned ahead of a close error.
    async fn run(&mut self, rounds: u64, transport: &Sender<OutgoingMessage>) -> Result<()> {
        let outcome = self.exchange(rounds, transport).await;
        let closed = match self {
            Self::Poisoning(controller) => controller.close(),
            Self::Honest { .. } => Ok(()),
        };
        outcome.and(closed)
    }

    async fn exchange(&mut self, rounds: u64, transport: &Sender<OutgoingMessage>) -> Result<()> {
        for _ in 0..rounds {
            for message in self.share_round()? {
                transport
                    .send(message)
                    .await
                    .map_err(|e| PoisonError::Sharing(format!("transport closed: {e}")))?;
            }
        }
        Ok(())
    }
}

/// What one node received over a simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxStats {
    pub received: u64,
    pub poisoned: u64,
}

/// Outcome of [`Simulation::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationReport {
    /// Final metrics of every poisoning node.
    pub per_node: BTreeMap<NodeId, PoisonMetrics>,

    /// Delivered traffic per destination.
    pub inboxes: BTreeMap<NodeId, InboxStats>,
}

impl SimulationReport {
    /// Fraction of all delivered messages that were poisoned, `None` if nothing was delivered.
    pub fn delivered_poison_rate(&self) -> Option<f64> {
        let (received, poisoned) = self
            .inboxes
            .values()
            .fold((0u64, 0u64), |(r, p), s| (r + s.received, p + s.poisoned));
        (received > 0).then(|| poisoned as f64 / received as f64)
    }
}

/// Multi-node harness running each node as its own task.
pub struct Simulation<S: MetricsSink> {
    nodes: Vec<SimNode<S>>,
    num_nodes: usize,
}

impl Simulation<JsonFileSink> {
    /// Creates a simulation persisting metrics under the configured `log_dir`.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid for `topology`.
    pub fn new(topology: &Topology, config: &PoisonConfig, buffer_len: usize) -> Result<Self> {
        let log_dir = config.log_dir.clone();
        Self::with_sinks(topology, config, buffer_len, |_| JsonFileSink::new(log_dir.clone()))
    }
}

impl<S: MetricsSink + 'static> Simulation<S> {
    /// Creates a simulation with one sink per poisoning node.
    ///
    /// # Arguments
    /// * `topology` - Communication graph.
    /// * `config` - Poisoning settings shared by every attacking node.
    /// * `buffer_len` - Length of every update.
    /// * `sink` - Builds the metrics sink of a poisoning node.
    pub fn with_sinks(
        topology: &Topology,
        config: &PoisonConfig,
        buffer_len: usize,
        mut sink: impl FnMut(NodeId) -> S,
    ) -> Result<Self> {
        let num_nodes = topology.num_nodes();
        let settings = config.validate(num_nodes)?;
        let attacking = config.attacking_nodes(num_nodes);

        let nodes = (0..num_nodes)
            .map(|uid| {
                let params = vec![(uid + 1) as f32; buffer_len];
                let sharing = StaticSharing::new(topology.neighbours(uid).to_vec(), params);
                if attacking.contains(&uid) {
                    let controller = PoisoningSharingController::with_settings(
                        uid,
                        settings.clone(),
                        sharing,
                        sink(uid),
                    );
                    SimNode::Poisoning(Box::new(controller))
                } else {
                    SimNode::Honest { uid, sharing }
                }
            })
            .collect();

        info!(num_nodes, attacking = attacking.len(), "simulation built");
        Ok(Self { nodes, num_nodes })
    }

    /// Runs `rounds` sharing cycles on every node concurrently, then closes all nodes.
    ///
    /// # Errors
    /// Returns the first node or task failure.
    pub async fn run(&mut self, rounds: u64) -> Result<SimulationReport> {
        let (sender, mut receiver) = mpsc::channel::<OutgoingMessage>(1024);
        let num_nodes = self.num_nodes;
        let collector = tokio::spawn(async move {
            let mut inboxes: BTreeMap<NodeId, InboxStats> =
                (0..num_nodes).map(|id| (id, InboxStats::default())).collect();
            while let Some(message) = receiver.recv().await {
                let inbox = inboxes.entry(message.destination).or_default();
                inbox.received += 1;
                if message.poisoned {
                    inbox.poisoned += 1;
                }
            }
            inboxes
        });

        let mut handles = Vec::with_capacity(self.nodes.len());
        for mut node in self.nodes.drain(..) {
            let transport = sender.clone();
            handles.push(tokio::spawn(async move {
                let outcome = node.run(rounds, &transport).await;
                (node, outcome)
            }));
        }
        drop(sender);

        let mut first_error = None;
        for handle in handles {
            let (node, outcome) = handle.await?;
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
            self.nodes.push(node);
        }
        let inboxes = collector.await?;
        if let Some(e) = first_error {
            return Err(e);
        }

        let per_node = self
            .nodes
            .iter()
            .filter_map(|node| match node {
                SimNode::Poisoning(c) => Some((c.uid(), c.metrics().clone())),
                SimNode::Honest { .. } => None,
            })
            .collect();
        Ok(SimulationReport { per_node, inboxes })
    }

    /// Ids of the nodes running the poisoning wrapper.
    pub fn poisoning_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                SimNode::Poisoning(c) => Some(c.uid()),
                SimNode::Honest { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attack::AttackType, config::TriggerKind, decision::TargetScope, metrics::MemorySink,
    };

    #[test]
    fn test_topologies() {
        let ring = Topology::ring(5);
        assert_eq!(ring.neighbours(0), &[1, 4]);
        assert_eq!(ring.neighbours(2), &[1, 3]);
        assert_eq!(Topology::ring(2).neighbours(0), &[1]);
        assert_eq!(Topology::fully_connected(4).neighbours(3), &[0, 1, 2]);
        assert!(Topology::from_adjacency(vec![vec![1], vec![2]]).is_err());
        assert!(Topology::from_adjacency(vec![vec![0]]).is_err());
    }

    #[tokio::test]
    async fn test_cadence_simulation() {
        let mut config = PoisonConfig::new(AttackType::Zero);
        config.trigger = TriggerKind::Cadence;
        config.adversarial_nodes = vec![1, 3];
        config.poison_after = 5;
        let topology = Topology::ring(6);
        let mut simulation =
            Simulation::with_sinks(&topology, &config, 4, |_| MemorySink::new()).unwrap();
        assert_eq!(simulation.poisoning_nodes(), vec![1, 3]);

        let report = simulation.run(10).await.unwrap();
        assert_eq!(report.per_node.len(), 2);
        for metrics in report.per_node.values() {
            assert_eq!(metrics.total_messages, 20);
            // Rounds 0 and 5 poison both messages.
            assert_eq!(metrics.poisoned_messages, 4);
            assert_eq!(metrics.rounds_poisoned, 10);
            assert_eq!(metrics.poison_rate, Some(0.2));
        }
        let total: u64 = report.inboxes.values().map(|s| s.received).sum();
        assert_eq!(total, 6 * 2 * 10);
        assert_eq!(report.inboxes[&2].poisoned, 4);
        assert_eq!(report.delivered_poison_rate(), Some(8.0 / 120.0));
    }

    #[tokio::test]
    async fn test_targeted_sender_simulation() {
        let mut config = PoisonConfig::new(AttackType::Flip);
        config.targeted_nodes = vec![0];
        config.target_scope = TargetScope::Sender;
        config.seed = Some(5);
        let topology = Topology::fully_connected(4);
        let mut simulation =
            Simulation::with_sinks(&topology, &config, 2, |_| MemorySink::new()).unwrap();
        let report = simulation.run(3).await.unwrap();
        assert_eq!(report.per_node.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(report.per_node[&0].poisoned_messages, 9);
        assert_eq!(report.inboxes[&0].poisoned, 0);
        assert_eq!(report.inboxes[&1].poisoned, 3);
    }

    #[test]
    fn test_simulation_rejects_out_of_graph_adversary() {
        let mut config = PoisonConfig::new(AttackType::Zero);
        config.trigger = TriggerKind::Cadence;
        config.adversarial_nodes = vec![8];
        let topology = Topology::ring(4);
        assert!(Simulation::with_sinks(&topology, &config, 1, |_| MemorySink::new()).is_err());
    }

    #[tokio::test]
    async fn test_node_closes_after_transport_failure() {
        let config = PoisonConfig::new(AttackType::Zero);
        let settings = config.validate(3).unwrap();
        let sharing = StaticSharing::new(vec![1, 2], vec![1.0; 2]);
        let controller =
            PoisoningSharingController::with_settings(0, settings, sharing, MemorySink::new());
        let mut node = SimNode::Poisoning(Box::new(controller));

        let (transport, receiver) = mpsc::channel(8);
        drop(receiver);
        let outcome = node.run(5, &transport).await;
        assert!(matches!(outcome, Err(PoisonError::Sharing(_))));

        let SimNode::Poisoning(controller) = node else {
            panic!("node changed kind");
        };
        assert!(controller.is_closed());
        let snapshot = controller.sink().latest(0).unwrap();
        assert_eq!(snapshot.total_messages, 2);
        assert_eq!(snapshot.rounds_poisoned, 1);
    }
}
