//! Cluster membership configurations and joint-consensus quorums.

use std::collections::BTreeSet;

use kestrel_common::types::NodeId;
use serde::{Deserialize, Serialize};

/// The set of voting members, possibly in a joint transition.
///
/// During a membership change the cluster runs under `Joint { old, new }`:
/// elections and commits require a majority of *both* sets. Once the joint
/// entry commits, the leader appends the final `Single(new)` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterConfig {
    Single(BTreeSet<NodeId>),
    Joint {
        old: BTreeSet<NodeId>,
        new: BTreeSet<NodeId>,
    },
}

impl ClusterConfig {
    pub fn single<I: IntoIterator<Item = NodeId>>(voters: I) -> Self {
        Self::Single(voters.into_iter().collect())
    }

    pub fn is_joint(&self) -> bool {
        matches!(self, Self::Joint { .. })
    }

    /// All nodes that currently hold a vote (union of both sets when joint).
    pub fn voters(&self) -> BTreeSet<NodeId> {
        match self {
            Self::Single(s) => s.clone(),
            Self::Joint { old, new } => old.union(new).copied().collect(),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        match self {
            Self::Single(s) => s.contains(&id),
            Self::Joint { old, new } => old.contains(&id) || new.contains(&id),
        }
    }

    /// True if the nodes satisfying `granted` form a quorum. Joint configs
    /// need a majority of the old set AND a majority of the new set.
    pub fn has_quorum<F: Fn(NodeId) -> bool>(&self, granted: F) -> bool {
        match self {
            Self::Single(s) => majority(s, &granted),
            Self::Joint { old, new } => majority(old, &granted) && majority(new, &granted),
        }
    }

    /// Acknowledgements needed for a commit. A joint config needs a
    /// majority of each set; the larger of the two is reported.
    pub fn quorum_size(&self) -> usize {
        match self {
            Self::Single(s) => majority_size(s),
            Self::Joint { old, new } => majority_size(old).max(majority_size(new)),
        }
    }

    /// Begin a transition from the current single config to `new`.
    /// Returns `None` while another change is still in flight.
    pub fn enter_joint(&self, new: BTreeSet<NodeId>) -> Option<Self> {
        match self {
            Self::Single(old) => Some(Self::Joint {
                old: old.clone(),
                new,
            }),
            Self::Joint { .. } => None,
        }
    }

    /// Leave the joint phase, keeping only the target set.
    pub fn finalize(&self) -> Option<Self> {
        match self {
            Self::Joint { new, .. } => Some(Self::Single(new.clone())),
            Self::Single(_) => None,
        }
    }
}

fn majority<F: Fn(NodeId) -> bool>(set: &BTreeSet<NodeId>, granted: &F) -> bool {
    let count = set.iter().filter(|&&id| granted(id)).count();
    count >= majority_size(set)
}

fn majority_size(set: &BTreeSet<NodeId>) -> usize {
    if set.is_empty() {
        0
    } else {
        set.len() / 2 + 1
    }
}
