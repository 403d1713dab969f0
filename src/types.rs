use serde::{Deserialize, Serialize};

/// Unique identifier of a participant in the gossip graph.
pub type NodeId = usize;

/// Flattened model update, one entry per weight.
pub type ParameterBuffer = Vec<f32>;

/// An honestly serialized update, as produced by the wrapped sharing component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HonestMessage {
    /// Peer (or virtual node) the update is addressed to.
    pub destination: NodeId,

    /// Serialized model parameters.
    pub params: ParameterBuffer,
}

/// Messages handed to the transport after the poisoning layer has seen them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Peer (or virtual node) the update is addressed to.
    pub destination: NodeId,

    /// Parameters actually sent, possibly corrupted.
    pub params: ParameterBuffer,

    /// True identity of the sender. Never spoofed.
    pub real_node: NodeId,

    /// Whether `params` was corrupted before sending.
    pub poisoned: bool,
}

impl OutgoingMessage {
    /// Wraps an honest message without altering its payload.
    pub fn honest(message: HonestMessage, real_node: NodeId) -> Self {
        Self {
            destination: message.destination,
            params: message.params,
            real_node,
            poisoned: false,
        }
    }
}
