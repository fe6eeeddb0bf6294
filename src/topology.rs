//! Cluster topology: the fixed tree that ties clusters to nodes per level.
//!
//! A cluster is a root-to-leaf path. At every active level the path passes
//! through one node, and clusters whose paths share a prefix share the nodes
//! on that prefix:
//!
//! ```text
//! level 0:            [0]                 (1 node, shared by all clusters)
//!                   /     \
//! level 1:        [0]     [1]             (fan-out 2)
//!                / | \   / | \
//! level 2:     [0][1][2][3][4][5]         (fan-out 3, one node per cluster)
//! ```
//!
//! Only levels in `[first_level, last_level)` carry parameters; the rest
//! have no nodes. The topology is immutable for the duration of a run.

use crate::error::{Error, Result};
use ndarray::Array2;
use std::ops::Range;

/// Entry of the node table for a level the cluster does not occupy.
pub const NO_NODE: usize = usize::MAX;

/// Immutable tree of clusters-to-nodes per level.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    /// Number of nodes at each level (zero outside the active range).
    level_counts: Vec<usize>,
    /// `nodes[[cluster, level]]`, or [`NO_NODE`] outside the active range.
    nodes: Array2<usize>,
    first_level: usize,
    last_level: usize,
    /// Fan-out between consecutive levels, when built from fan-outs.
    fan_outs: Option<Vec<usize>>,
}

impl Topology {
    /// Create a topology from explicit per-level node counts and a node table.
    ///
    /// `nodes[[cluster, level]]` must be below `level_counts[level]` for every
    /// cluster and every level in `[first_level, last_level)`.
    pub fn new(
        level_counts: Vec<usize>,
        nodes: Array2<usize>,
        first_level: usize,
        last_level: usize,
    ) -> Result<Self> {
        let topology = Self {
            level_counts,
            nodes,
            first_level,
            last_level,
            fan_outs: None,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Build the balanced tree described by `fan_outs`.
    ///
    /// There are `fan_outs.len() + 1` levels; level `l` has the product of
    /// the first `l` fan-outs as node count, and the number of clusters is
    /// the product of all of them.
    pub fn from_fan_outs(fan_outs: &[usize], first_level: usize, last_level: usize) -> Result<Self> {
        if fan_outs.iter().any(|&f| f == 0) {
            return Err(Error::InvalidParameter {
                name: "fan_outs",
                message: "every fan-out must be > 0",
            });
        }
        let num_levels = fan_outs.len() + 1;

        let mut level_counts = vec![0usize; num_levels];
        let mut count = 1usize;
        for (level, slot) in level_counts.iter_mut().enumerate() {
            if level >= first_level && level < last_level {
                *slot = count;
            }
            if level + 1 < num_levels {
                count *= fan_outs[level];
            }
        }
        let num_clusters = count;

        let mut nodes = Array2::from_elem((num_clusters, num_levels), NO_NODE);
        for cluster in 0..num_clusters {
            let mut node = cluster;
            for level in (first_level..num_levels).rev() {
                if level < last_level {
                    nodes[[cluster, level]] = node;
                }
                if level > 0 {
                    node /= fan_outs[level - 1];
                }
            }
        }

        let topology = Self {
            level_counts,
            nodes,
            first_level,
            last_level,
            fan_outs: Some(fan_outs.to_vec()),
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Flat topology: one level, one node per cluster.
    pub fn flat(num_clusters: usize) -> Result<Self> {
        Self::from_fan_outs(&[num_clusters], 1, 2)
    }

    /// Derive a shallower topology that keeps the cluster mapping but drops
    /// every level at or beyond `last_level`.
    pub fn sub_topology(&self, last_level: usize) -> Result<Self> {
        if last_level <= self.first_level || last_level > self.last_level {
            return Err(Error::InvalidTopology(format!(
                "sub-topology last level {last_level} outside ({}, {}]",
                self.first_level, self.last_level
            )));
        }
        let mut level_counts = self.level_counts.clone();
        let mut nodes = self.nodes.clone();
        for level in last_level..self.num_levels() {
            level_counts[level] = 0;
            nodes.column_mut(level).fill(NO_NODE);
        }
        Ok(Self {
            level_counts,
            nodes,
            first_level: self.first_level,
            last_level,
            fan_outs: self.fan_outs.clone(),
        })
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<()> {
        let num_levels = self.level_counts.len();
        if num_levels == 0 || self.nodes.nrows() == 0 {
            return Err(Error::InvalidTopology("topology has no levels or clusters".into()));
        }
        if self.nodes.ncols() != num_levels {
            return Err(Error::ShapeMismatch {
                expected: format!("{num_levels} node columns"),
                actual: format!("{} node columns", self.nodes.ncols()),
            });
        }
        if self.first_level >= self.last_level || self.last_level > num_levels {
            return Err(Error::InvalidTopology(format!(
                "active levels [{}, {}) do not fit in {num_levels} levels",
                self.first_level, self.last_level
            )));
        }
        for level in self.levels() {
            if self.level_counts[level] == 0 {
                return Err(Error::InvalidTopology(format!("active level {level} has no nodes")));
            }
            for cluster in 0..self.num_clusters() {
                let node = self.nodes[[cluster, level]];
                if node >= self.level_counts[level] {
                    return Err(Error::InvalidTopology(format!(
                        "cluster {cluster} maps to node {node} at level {level}, \
                         which has {} nodes",
                        self.level_counts[level]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of clusters (root-to-leaf paths).
    pub fn num_clusters(&self) -> usize {
        self.nodes.nrows()
    }

    /// Total number of levels, active or not.
    pub fn num_levels(&self) -> usize {
        self.level_counts.len()
    }

    /// First active level.
    pub fn first_level(&self) -> usize {
        self.first_level
    }

    /// One past the last active level.
    pub fn last_level(&self) -> usize {
        self.last_level
    }

    /// Active levels, in order.
    pub fn levels(&self) -> Range<usize> {
        self.first_level..self.last_level
    }

    /// Number of active levels.
    pub fn num_active_levels(&self) -> usize {
        self.last_level - self.first_level
    }

    /// Node counts per level.
    pub fn level_counts(&self) -> &[usize] {
        &self.level_counts
    }

    /// Node count at `level`.
    pub fn level_count(&self, level: usize) -> usize {
        self.level_counts[level]
    }

    /// Node owned by `cluster` at the active `level`.
    #[inline]
    pub fn node(&self, cluster: usize, level: usize) -> usize {
        debug_assert!(level >= self.first_level && level < self.last_level);
        self.nodes[[cluster, level]]
    }

    /// Node owned by `cluster` at `level`, if the level is active.
    pub fn try_node(&self, cluster: usize, level: usize) -> Option<usize> {
        match self.nodes.get([cluster, level]) {
            Some(&n) if n != NO_NODE => Some(n),
            _ => None,
        }
    }

    /// Fan-outs the topology was built from, if any.
    pub fn fan_outs(&self) -> Option<&[usize]> {
        self.fan_outs.as_deref()
    }

    /// Number of level blocks when levels are tied in groups of `tie_count`.
    pub fn num_blocks(&self, tie_count: usize) -> usize {
        let tie = tie_count.max(1);
        self.num_active_levels().div_ceil(tie)
    }

    /// Active levels belonging to `block` when tied in groups of `tie_count`.
    pub fn block_levels(&self, block: usize, tie_count: usize) -> Range<usize> {
        let tie = tie_count.max(1);
        let start = self.first_level + block * tie;
        start..(start + tie).min(self.last_level)
    }

    /// Whether `other` has the same clusters, level range and node counts.
    pub fn same_shape(&self, other: &Topology) -> bool {
        self.level_counts == other.level_counts
            && self.first_level == other.first_level
            && self.last_level == other.last_level
            && self.num_clusters() == other.num_clusters()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_counts_and_mapping() {
        let t = Topology::from_fan_outs(&[2, 3], 0, 3).unwrap();
        assert_eq!(t.level_counts(), &[1, 2, 6]);
        assert_eq!(t.num_clusters(), 6);
        assert_eq!(t.node(5, 0), 0);
        assert_eq!(t.node(5, 1), 1);
        assert_eq!(t.node(5, 2), 5);
        assert_eq!(t.node(2, 1), 0);
        assert_eq!(t.node(3, 1), 1);
    }

    #[test]
    fn test_inactive_levels_have_no_nodes() {
        let t = Topology::from_fan_outs(&[2, 3], 1, 3).unwrap();
        assert_eq!(t.level_counts(), &[0, 2, 6]);
        assert_eq!(t.try_node(4, 0), None);
        assert_eq!(t.try_node(4, 1), Some(1));
        assert_eq!(t.num_active_levels(), 2);
    }

    #[test]
    fn test_flat_topology() {
        let t = Topology::flat(4).unwrap();
        assert_eq!(t.num_clusters(), 4);
        assert_eq!(t.levels(), 1..2);
        for c in 0..4 {
            assert_eq!(t.node(c, 1), c);
        }
    }

    #[test]
    fn test_sub_topology_drops_deep_levels() {
        let t = Topology::from_fan_outs(&[2, 2, 2], 0, 4).unwrap();
        let sub = t.sub_topology(2).unwrap();
        assert_eq!(sub.num_clusters(), 8);
        assert_eq!(sub.levels(), 0..2);
        assert_eq!(sub.level_counts(), &[1, 2, 0, 0]);
        assert_eq!(sub.node(7, 1), 1);
        assert!(t.sub_topology(0).is_err());
    }

    #[test]
    fn test_explicit_topology_rejects_out_of_range_node() {
        let nodes = Array2::from_shape_vec((2, 1), vec![0, 2]).unwrap();
        let err = Topology::new(vec![2], nodes, 0, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidTopology(_)));
    }

    #[test]
    fn test_blocks_cover_levels() {
        let t = Topology::from_fan_outs(&[1, 1, 1, 1], 0, 5).unwrap();
        assert_eq!(t.num_blocks(2), 3);
        assert_eq!(t.block_levels(0, 2), 0..2);
        assert_eq!(t.block_levels(2, 2), 4..5);
    }

    #[test]
    fn test_zero_fan_out_rejected() {
        assert!(Topology::from_fan_outs(&[2, 0], 0, 3).is_err());
    }
}
