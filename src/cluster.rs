//! Agglomerative hierarchical clustering over an RF matrix.
//!
//! The tree is an arena: leaves occupy ids `0..n` (leaf `i` is marker `i`
//! of the clustered matrix) and every merge is appended after both of its
//! children, so ascending id order is a valid bottom-up traversal.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::PergolaError;
use crate::recomb::RfMatrix;

/// Index of a node in a [`ClusterTree`].
pub type NodeId = usize;

/// How the distance between two clusters is derived from marker distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Nearest pair of members.
    Single,
    /// Farthest pair of members.
    Complete,
    /// Mean over all member pairs (UPGMA).
    #[default]
    Average,
    /// Mean of the two merged clusters' distances (WPGMA).
    Weighted,
}

impl Linkage {
    /// Lance-Williams update: distance from the merge of `a` and `b` to `k`.
    fn update(&self, d_ak: f64, d_bk: f64, size_a: usize, size_b: usize) -> f64 {
        match self {
            Linkage::Single => d_ak.min(d_bk),
            Linkage::Complete => d_ak.max(d_bk),
            Linkage::Average => {
                let (na, nb) = (size_a as f64, size_b as f64);
                (na * d_ak + nb * d_bk) / (na + nb)
            }
            Linkage::Weighted => 0.5 * (d_ak + d_bk),
        }
    }
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Linkage::Single => "single",
            Linkage::Complete => "complete",
            Linkage::Average => "average",
            Linkage::Weighted => "weighted",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Linkage {
    type Err = PergolaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(Linkage::Single),
            "complete" => Ok(Linkage::Complete),
            "average" | "upgma" => Ok(Linkage::Average),
            "weighted" | "wpgma" | "mcquitty" => Ok(Linkage::Weighted),
            _ => Err(PergolaError::InvalidInput(format!(
                "unknown linkage '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterNode {
    Leaf {
        marker: usize,
    },
    Merge {
        left: NodeId,
        right: NodeId,
        height: f64,
        size: usize,
    },
}

/// The closest active slot after `a`, the lowest such slot on ties.
fn nearest_after(dist: &Array2<f64>, active: &[bool], a: usize) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for b in ((a + 1)..active.len()).filter(|&b| active[b]) {
        let d = dist[[a, b]];
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((b, d));
        }
    }
    best
}

/// A binary clustering tree over the markers of an RF matrix.
#[derive(Debug, Clone)]
pub struct ClusterTree {
    nodes: Vec<ClusterNode>,
    n_leaves: usize,
}

impl ClusterTree {
    /// Cluster all markers of `rf`.
    ///
    /// Among equally close cluster pairs the one with the lowest indices is
    /// merged first, so the tree is deterministic.
    pub fn build(rf: &RfMatrix, linkage: Linkage) -> Result<ClusterTree, PergolaError> {
        let n = rf.len();
        if n == 0 {
            return Err(PergolaError::EmptyGroup(
                "cannot cluster zero markers".into(),
            ));
        }

        let mut nodes: Vec<ClusterNode> = (0..n).map(|marker| ClusterNode::Leaf { marker }).collect();
        nodes.reserve(n - 1);

        // working distances, indexed by slot; a slot holds one active cluster
        let mut dist = rf.values.clone();
        let mut slot_node: Vec<NodeId> = (0..n).collect();
        let mut slot_size = vec![1usize; n];
        let mut active = vec![true; n];

        // nearest later slot of every active slot, kept current across merges
        let mut nearest: Vec<Option<(usize, f64)>> =
            (0..n).map(|a| nearest_after(&dist, &active, a)).collect();

        for _ in 1..n {
            let mut best: Option<(usize, usize, f64)> = None;
            for a in (0..n).filter(|&a| active[a]) {
                if let Some((b, d)) = nearest[a] {
                    if best.map_or(true, |(_, _, bd)| d < bd) {
                        best = Some((a, b, d));
                    }
                }
            }
            let (a, b, height) = best.ok_or_else(|| {
                PergolaError::InvalidInput("no pair of clusters left to merge".into())
            })?;

            let (size_a, size_b) = (slot_size[a], slot_size[b]);
            for k in (0..n).filter(|&k| active[k] && k != a && k != b) {
                let d = linkage.update(dist[[a, k]], dist[[b, k]], size_a, size_b);
                dist[[a, k]] = d;
                dist[[k, a]] = d;
            }

            nodes.push(ClusterNode::Merge {
                left: slot_node[a],
                right: slot_node[b],
                height: height.max(0.0),
                size: size_a + size_b,
            });
            slot_node[a] = nodes.len() - 1;
            slot_size[a] = size_a + size_b;
            active[b] = false;
            nearest[b] = None;

            for k in (0..n).filter(|&k| active[k]) {
                match nearest[k] {
                    Some((j, _)) if k == a || j == a || j == b => {
                        nearest[k] = nearest_after(&dist, &active, k);
                    }
                    Some((j, d)) if k < a => {
                        let da = dist[[k, a]];
                        if da < d || (da == d && a < j) {
                            nearest[k] = Some((a, da));
                        }
                    }
                    None if k == a => nearest[k] = nearest_after(&dist, &active, k),
                    _ => {}
                }
            }
        }

        debug!(markers = n, %linkage, "built clustering tree");
        Ok(ClusterTree { nodes, n_leaves: n })
    }

    pub fn n_leaves(&self) -> usize {
        self.n_leaves
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> NodeId {
        self.nodes.len() - 1
    }

    pub fn node(&self, id: NodeId) -> &ClusterNode {
        &self.nodes[id]
    }

    /// The two children of a merge node, or `None` for a leaf.
    pub fn children(&self, id: NodeId) -> Option<(NodeId, NodeId)> {
        match self.nodes[id] {
            ClusterNode::Leaf { .. } => None,
            ClusterNode::Merge { left, right, .. } => Some((left, right)),
        }
    }

    /// Ids of the merge nodes, children before parents.
    pub fn merges(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.n_leaves..self.nodes.len()
    }

    /// Exchange the children of a merge node. Leaves are left untouched.
    pub fn swap_children(&mut self, id: NodeId) {
        if let ClusterNode::Merge { left, right, .. } = &mut self.nodes[id] {
            std::mem::swap(left, right);
        }
    }

    /// Reverse the leaf order below `id` by swapping children at every merge
    /// in its subtree.
    pub fn flip(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            if let Some((left, right)) = self.children(node) {
                self.swap_children(node);
                stack.push(left);
                stack.push(right);
            }
        }
    }

    /// Markers below `id`, left to right.
    pub fn leaves(&self, id: NodeId) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            match self.nodes[node] {
                ClusterNode::Leaf { marker } => out.push(marker),
                ClusterNode::Merge { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        out
    }

    /// All markers, left to right.
    pub fn leaf_order(&self) -> Vec<usize> {
        self.leaves(self.root())
    }

    /// Assign every leaf a 1-based cluster label after undoing the last
    /// `k - 1` merges. Labels follow the first appearance by marker index.
    pub fn cut(&self, k: usize) -> Result<Vec<usize>, PergolaError> {
        if k == 0 || k > self.n_leaves {
            return Err(PergolaError::InvalidInput(format!(
                "cannot cut {} markers into {} groups",
                self.n_leaves, k
            )));
        }
        let keep = self.n_leaves - k;
        Ok(self.labels(|index, _| index < keep))
    }

    /// Assign every leaf a 1-based cluster label keeping only merges at or
    /// below `height`.
    pub fn cut_height(&self, height: f64) -> Vec<usize> {
        self.labels(|_, h| h <= height)
    }

    fn labels<F: Fn(usize, f64) -> bool>(&self, keep: F) -> Vec<usize> {
        let n = self.n_leaves;
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        // a representative leaf of each node's subtree
        let mut rep: Vec<usize> = (0..n).collect();
        for (index, id) in self.merges().enumerate() {
            if let ClusterNode::Merge {
                left,
                right,
                height,
                ..
            } = self.nodes[id]
            {
                let (ra, rb) = (rep[left], rep[right]);
                rep.push(ra);
                if keep(index, height) {
                    let (fa, fb) = (find(&mut parent, ra), find(&mut parent, rb));
                    parent[fa.max(fb)] = fa.min(fb);
                }
            }
        }

        let mut label_of_root = vec![0usize; n];
        let mut next = 0;
        (0..n)
            .map(|i| {
                let r = find(&mut parent, i);
                if label_of_root[r] == 0 {
                    next += 1;
                    label_of_root[r] = next;
                }
                label_of_root[r]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn rf(values: ndarray::Array2<f64>) -> RfMatrix {
        let ids = (0..values.nrows()).map(|i| format!("m{}", i)).collect();
        RfMatrix::new(ids, values).unwrap()
    }

    fn two_blocks() -> RfMatrix {
        rf(array![
            [0.00, 0.05, 0.10, 0.40, 0.45],
            [0.05, 0.00, 0.08, 0.42, 0.44],
            [0.10, 0.08, 0.00, 0.41, 0.43],
            [0.40, 0.42, 0.41, 0.00, 0.02],
            [0.45, 0.44, 0.43, 0.02, 0.00],
        ])
    }

    /// Merges found by rescanning every active pair at each step.
    fn full_scan_merges(rf: &RfMatrix, linkage: Linkage) -> Vec<(NodeId, NodeId, f64)> {
        let n = rf.len();
        let mut dist = rf.values.clone();
        let mut slot_node: Vec<NodeId> = (0..n).collect();
        let mut slot_size = vec![1usize; n];
        let mut active = vec![true; n];
        let mut merges = Vec::new();
        for _ in 1..n {
            let mut best: Option<(usize, usize, f64)> = None;
            for a in (0..n).filter(|&a| active[a]) {
                for b in ((a + 1)..n).filter(|&b| active[b]) {
                    if best.map_or(true, |(_, _, bd)| dist[[a, b]] < bd) {
                        best = Some((a, b, dist[[a, b]]));
                    }
                }
            }
            let (a, b, h) = best.unwrap();
            for k in (0..n).filter(|&k| active[k] && k != a && k != b) {
                let d = linkage.update(dist[[a, k]], dist[[b, k]], slot_size[a], slot_size[b]);
                dist[[a, k]] = d;
                dist[[k, a]] = d;
            }
            merges.push((slot_node[a], slot_node[b], h));
            slot_node[a] = n + merges.len() - 1;
            slot_size[a] += slot_size[b];
            active[b] = false;
        }
        merges
    }

    #[test]
    fn test_nearest_cache_matches_full_scan() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(17);
        for linkage in [
            Linkage::Single,
            Linkage::Complete,
            Linkage::Average,
            Linkage::Weighted,
        ] {
            for _ in 0..10 {
                // coarse values force many ties
                let n = 30;
                let mut values = ndarray::Array2::<f64>::zeros((n, n));
                for i in 0..n {
                    for j in (i + 1)..n {
                        let v = rng.gen_range(1..=10) as f64 / 20.0;
                        values[[i, j]] = v;
                        values[[j, i]] = v;
                    }
                }
                let rf = rf(values);
                let tree = ClusterTree::build(&rf, linkage).unwrap();
                let found: Vec<(NodeId, NodeId, f64)> = tree
                    .merges()
                    .map(|id| match tree.node(id) {
                        ClusterNode::Merge {
                            left,
                            right,
                            height,
                            ..
                        } => (*left, *right, *height),
                        ClusterNode::Leaf { .. } => unreachable!(),
                    })
                    .collect();
                assert_eq!(found, full_scan_merges(&rf, linkage), "{}", linkage);
            }
        }
    }

    #[test]
    fn test_build_structure() {
        let tree = ClusterTree::build(&two_blocks(), Linkage::Average).unwrap();
        assert_eq!(tree.n_leaves(), 5);
        assert_eq!(tree.n_nodes(), 9);
        // closest pair first
        assert_eq!(tree.children(5), Some((3, 4)));
        let mut leaves = tree.leaf_order();
        leaves.sort_unstable();
        assert_eq!(leaves, vec![0, 1, 2, 3, 4]);
        for id in tree.merges() {
            if let ClusterNode::Merge { height, .. } = tree.node(id) {
                assert!(*height >= 0.0);
            }
        }
        if let ClusterNode::Merge { size, .. } = tree.node(tree.root()) {
            assert_eq!(*size, 5);
        }
    }

    #[test]
    fn test_cut() {
        for linkage in [
            Linkage::Single,
            Linkage::Complete,
            Linkage::Average,
            Linkage::Weighted,
        ] {
            let tree = ClusterTree::build(&two_blocks(), linkage).unwrap();
            assert_eq!(tree.cut(2).unwrap(), vec![1, 1, 1, 2, 2]);
            assert_eq!(tree.cut(1).unwrap(), vec![1; 5]);
            assert_eq!(tree.cut(5).unwrap(), vec![1, 2, 3, 4, 5]);
        }
        let tree = ClusterTree::build(&two_blocks(), Linkage::Average).unwrap();
        assert!(tree.cut(0).is_err());
        assert!(tree.cut(6).is_err());
    }

    #[test]
    fn test_cut_height() {
        let tree = ClusterTree::build(&two_blocks(), Linkage::Single).unwrap();
        assert_eq!(tree.cut_height(0.2), vec![1, 1, 1, 2, 2]);
        assert_eq!(tree.cut_height(0.03), vec![1, 2, 3, 4, 4]);
        assert_eq!(tree.cut_height(1.0), vec![1; 5]);
    }

    #[test]
    fn test_single_leaf() {
        let tree = ClusterTree::build(&rf(array![[0.0]]), Linkage::Average).unwrap();
        assert_eq!(tree.root(), 0);
        assert_eq!(tree.leaf_order(), vec![0]);
        assert_eq!(tree.cut(1).unwrap(), vec![1]);
        assert!(tree.children(0).is_none());
    }

    #[test]
    fn test_empty() {
        let empty = RfMatrix::new(vec![], ndarray::Array2::zeros((0, 0))).unwrap();
        assert!(matches!(
            ClusterTree::build(&empty, Linkage::Average),
            Err(PergolaError::EmptyGroup(_))
        ));
    }

    #[test]
    fn test_flip_reverses() {
        let mut tree = ClusterTree::build(&two_blocks(), Linkage::Average).unwrap();
        let before = tree.leaf_order();
        let root = tree.root();
        tree.flip(root);
        let mut after = tree.leaf_order();
        after.reverse();
        assert_eq!(before, after);
    }

    #[test]
    fn test_linkage_parse() {
        assert_eq!("UPGMA".parse::<Linkage>().unwrap(), Linkage::Average);
        assert_eq!("single".parse::<Linkage>().unwrap(), Linkage::Single);
        assert!("ward".parse::<Linkage>().is_err());
        assert_eq!(Linkage::Complete.to_string(), "complete");
    }
}
