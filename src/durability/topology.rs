use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Name of a node taking part in a replication chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId::new(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered chain of nodes; the first slot is the active. Undefined slots
/// still count toward the chain size but never acknowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationChain {
    nodes: Vec<Option<NodeId>>,
}

impl ReplicationChain {
    pub fn active(&self) -> Option<&NodeId> {
        self.nodes.first().and_then(Option::as_ref)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().skip(1).filter_map(Option::as_ref)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn replica_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn defined_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.iter().flatten().any(|candidate| candidate == node)
    }
}

/// One chain normally, two while the shard is being moved between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationTopology {
    chains: Vec<ReplicationChain>,
}

impl ReplicationTopology {
    pub fn from_chains<N: Into<NodeId>>(
        chains: Vec<Vec<Option<N>>>,
    ) -> Result<Self, TopologyError> {
        let topology = Self {
            chains: chains
                .into_iter()
                .map(|chain| ReplicationChain {
                    nodes: chain
                        .into_iter()
                        .map(|node| node.map(Into::into))
                        .collect(),
                })
                .collect(),
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Parses the `[["active", "replica"], ...]` form used by cluster
    /// management.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, TopologyError> {
        let topology: ReplicationTopology = serde_json::from_value(value.clone())
            .map_err(|err| TopologyError::Malformed(err.to_string()))?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn single_node(active: impl Into<NodeId>) -> Self {
        Self {
            chains: vec![ReplicationChain {
                nodes: vec![Some(active.into())],
            }],
        }
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.chains.is_empty() || self.chains.len() > 2 {
            return Err(TopologyError::ChainCount(self.chains.len()));
        }
        for chain in &self.chains {
            if chain.size() == 0 {
                return Err(TopologyError::EmptyChain);
            }
            if chain.active().is_none() {
                return Err(TopologyError::UndefinedActive);
            }
        }
        Ok(())
    }

    pub fn chains(&self) -> &[ReplicationChain] {
        &self.chains
    }

    pub fn max_replicas(&self) -> usize {
        self.chains
            .iter()
            .map(ReplicationChain::replica_count)
            .max()
            .unwrap_or(0)
    }

    /// True when every chain has enough defined nodes to ever form a majority.
    pub fn majority_reachable(&self) -> bool {
        self.chains
            .iter()
            .all(|chain| chain.defined_nodes() >= chain.majority())
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.chains.iter().any(|chain| chain.contains(node))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("topology must have one or two chains, got {0}")]
    ChainCount(usize),
    #[error("replication chain is empty")]
    EmptyChain,
    #[error("replication chain has no active node")]
    UndefinedActive,
    #[error("malformed topology: {0}")]
    Malformed(String),
}
