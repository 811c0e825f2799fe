//! Marker ordering within linkage groups.
//!
//! The quality of an order is its SARF, the sum of adjacent recombination
//! frequencies: with a window of `n`, every marker is paired with each of the
//! next `n` markers in the order. A window of one sums immediate neighbors.
//!
//! Orders are searched over the leaf orders of a clustering tree, i.e. those
//! reachable by swapping the children of internal nodes. Within that space
//! the one-neighbor SARF is minimized exactly by dynamic programming over
//! (leftmost leaf, rightmost leaf) pairs of every subtree. Among orders that
//! tie on it, a wider window decides, first among the tied end pairs at the
//! root and then by flipping subtrees while the one-neighbor SARF holds.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, info};

use crate::cluster::{ClusterTree, Linkage, NodeId};
use crate::error::PergolaError;
use crate::file::writer_or_stdout;
use crate::group::{GroupAssignment, GroupId};
use crate::recomb::{format_float, RfMatrix};

/// Configuration of the leaf orderer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderOptions {
    /// Linkage used for each group's clustering tree.
    pub linkage: Linkage,
    /// SARF window used to break ties between orders with equal
    /// one-neighbor SARF. A window of 1 disables tie-breaking.
    pub window: usize,
    /// Costs within this distance of each other count as equal.
    pub tolerance: f64,
    /// Run the subtree-flipping refinement after the tree optimum.
    pub refine: bool,
    /// Upper bound on refinement passes over the tree.
    pub max_passes: usize,
}

impl Default for OrderOptions {
    fn default() -> Self {
        Self {
            linkage: Linkage::Average,
            window: 2,
            tolerance: 1e-9,
            refine: true,
            max_passes: 50,
        }
    }
}

/// SARF of `order` over `rf` with a window of `n` neighbors.
///
/// Sums `rf[order[k], order[k + o]]` for every position `k` and every offset
/// `o` in `1..=n` that stays inside the order. Pure and deterministic.
pub fn sarf(rf: ArrayView2<f64>, order: &[usize], n: usize) -> Result<f64, PergolaError> {
    let (nrows, ncols) = rf.dim();
    if nrows != ncols {
        return Err(PergolaError::InvalidInput(format!(
            "RF matrix must be square, got {}x{}",
            nrows, ncols
        )));
    }
    if let Some(&bad) = order.iter().find(|&&i| i >= nrows) {
        return Err(PergolaError::InvalidInput(format!(
            "order index {} out of range for {} markers",
            bad, nrows
        )));
    }
    Ok(window_cost(rf, order, n))
}

fn window_cost(rf: ArrayView2<f64>, order: &[usize], n: usize) -> f64 {
    order
        .iter()
        .enumerate()
        .map(|(k, &a)| {
            order[k + 1..]
                .iter()
                .take(n)
                .map(|&b| rf[[a, b]])
                .sum::<f64>()
        })
        .sum()
}

/// Leaf sets of every node of a tree, in its current left-to-right order,
/// with the position of each leaf so that subtree membership is a range test.
struct Layout {
    node_leaves: Vec<Vec<usize>>,
    rank: Vec<usize>,
    span: Vec<(usize, usize)>,
}

impl Layout {
    fn new(tree: &ClusterTree) -> Self {
        let mut node_leaves: Vec<Vec<usize>> = Vec::with_capacity(tree.n_nodes());
        for id in 0..tree.n_nodes() {
            let leaves = match tree.children(id) {
                None => tree.leaves(id),
                Some((a, b)) => {
                    let mut leaves = node_leaves[a].clone();
                    leaves.extend_from_slice(&node_leaves[b]);
                    leaves
                }
            };
            node_leaves.push(leaves);
        }

        let mut rank = vec![0; tree.n_leaves()];
        for (position, &leaf) in node_leaves[tree.root()].iter().enumerate() {
            rank[leaf] = position;
        }
        let span = node_leaves
            .iter()
            .map(|leaves| {
                let start = rank[leaves[0]];
                (start, start + leaves.len())
            })
            .collect();
        Self {
            node_leaves,
            rank,
            span,
        }
    }

    fn contains(&self, node: NodeId, leaf: usize) -> bool {
        let (start, end) = self.span[node];
        (start..end).contains(&self.rank[leaf])
    }

    /// Every (first, last) leaf pair an order of `node`'s subtree can have.
    fn end_pairs(&self, tree: &ClusterTree, node: NodeId) -> Vec<(usize, usize)> {
        match tree.children(node) {
            None => {
                let x = self.node_leaves[node][0];
                vec![(x, x)]
            }
            Some((a, b)) => {
                let (left, right) = (&self.node_leaves[a], &self.node_leaves[b]);
                let mut pairs = Vec::with_capacity(2 * left.len() * right.len());
                for &x in left {
                    for &y in right {
                        pairs.push((x, y));
                        pairs.push((y, x));
                    }
                }
                pairs
            }
        }
    }
}

/// Best one-neighbor SARF of every subtree for each pair of end leaves.
///
/// `cost[[i, j]]` is filled at the lowest common ancestor `v` of `i` and `j`
/// and is the cheapest order of `v`'s leaves running from `i` to `j`.
/// `via[[i, j]] = (x, y)` records the two leaves meeting across the boundary
/// between `v`'s children: the order is `i..x` then `y..j`.
struct EndPairTable {
    cost: Array2<f64>,
    via: Array2<(usize, usize)>,
}

impl EndPairTable {
    fn fill(tree: &ClusterTree, layout: &Layout, rf: ArrayView2<f64>) -> Self {
        let n = tree.n_leaves();
        let mut cost = Array2::from_elem((n, n), f64::INFINITY);
        for i in 0..n {
            cost[[i, i]] = 0.0;
        }
        let mut via = Array2::from_elem((n, n), (0usize, 0usize));
        let mut pos = vec![0usize; n];

        for v in tree.merges() {
            let Some((a, b)) = tree.children(v) else {
                continue;
            };
            let left = &layout.node_leaves[a];
            let right = &layout.node_leaves[b];
            for (p, &x) in left.iter().enumerate() {
                pos[x] = p;
            }
            for (q, &y) in right.iter().enumerate() {
                pos[y] = q;
            }

            // best order of the left part from i to some k, followed by l
            let mut to_boundary = Array2::from_elem((left.len(), right.len()), f64::INFINITY);
            let mut boundary_k = Array2::<usize>::zeros((left.len(), right.len()));
            for (i, k) in layout.end_pairs(tree, a) {
                let base = cost[[i, k]];
                for (q, &l) in right.iter().enumerate() {
                    let c = base + rf[[k, l]];
                    if c < to_boundary[[pos[i], q]] {
                        to_boundary[[pos[i], q]] = c;
                        boundary_k[[pos[i], q]] = k;
                    }
                }
            }

            for (l, j) in layout.end_pairs(tree, b) {
                let tail = cost[[l, j]];
                for (p, &i) in left.iter().enumerate() {
                    let c = to_boundary[[p, pos[l]]] + tail;
                    if c < cost[[i, j]] {
                        cost[[i, j]] = c;
                        via[[i, j]] = (boundary_k[[p, pos[l]]], l);
                    }
                }
            }

            // the reversed orders cost the same
            for &i in left {
                for &j in right {
                    cost[[j, i]] = cost[[i, j]];
                    let (k, l) = via[[i, j]];
                    via[[j, i]] = (l, k);
                }
            }
        }
        Self { cost, via }
    }

    /// The leaf order from `first` to `last` below `node`, and the merge nodes
    /// whose children must be swapped to produce it.
    fn traceback(
        &self,
        tree: &ClusterTree,
        layout: &Layout,
        node: NodeId,
        first: usize,
        last: usize,
    ) -> (Vec<usize>, Vec<NodeId>) {
        let mut order = Vec::with_capacity(layout.node_leaves[node].len());
        let mut swaps = Vec::new();
        let mut stack = vec![(node, first, last)];
        while let Some((v, i, j)) = stack.pop() {
            match tree.children(v) {
                None => order.push(i),
                Some((a, b)) => {
                    let (x, y) = self.via[[i, j]];
                    let (head, tail) = if layout.contains(a, i) {
                        (a, b)
                    } else {
                        swaps.push(v);
                        (b, a)
                    };
                    stack.push((tail, y, j));
                    stack.push((head, i, x));
                }
            }
        }
        (order, swaps)
    }
}

/// Reorder the leaves of `tree` in place to minimize the SARF of the leaf
/// order over `rf`, and return that order.
///
/// `rf` is indexed by the tree's leaf markers. Only child swaps are applied;
/// the topology and merge heights are unchanged.
pub fn optimal_leaf_order(
    tree: &mut ClusterTree,
    rf: ArrayView2<f64>,
    options: &OrderOptions,
) -> Vec<usize> {
    let root = tree.root();
    let Some((a, b)) = tree.children(root) else {
        return tree.leaf_order();
    };
    if tree.n_leaves() <= 2 {
        return tree.leaf_order();
    }

    let layout = Layout::new(tree);
    let table = EndPairTable::fill(tree, &layout, rf);

    // one direction suffices; reversals cost the same
    let mut ends = Vec::with_capacity(layout.node_leaves[a].len() * layout.node_leaves[b].len());
    for &i in &layout.node_leaves[a] {
        for &j in &layout.node_leaves[b] {
            ends.push((i, j, table.cost[[i, j]]));
        }
    }
    let best = ends.iter().map(|e| e.2).fold(f64::INFINITY, f64::min);
    let tied: Vec<(usize, usize)> = ends
        .iter()
        .filter(|e| e.2 <= best + options.tolerance)
        .map(|e| (e.0, e.1))
        .collect();

    let (first, last) = tied[0];
    let (mut chosen_order, mut chosen_swaps) = table.traceback(tree, &layout, root, first, last);
    if options.window > 1 && tied.len() > 1 {
        let mut chosen_wide = window_cost(rf, &chosen_order, options.window);
        for &(first, last) in &tied[1..] {
            let (order, swaps) = table.traceback(tree, &layout, root, first, last);
            let wide = window_cost(rf, &order, options.window);
            if wide < chosen_wide - options.tolerance {
                chosen_order = order;
                chosen_swaps = swaps;
                chosen_wide = wide;
            }
        }
    }
    debug!(
        leaves = tree.n_leaves(),
        tied = tied.len(),
        sarf = best,
        "tree-restricted optimum"
    );

    for v in chosen_swaps {
        tree.swap_children(v);
    }
    debug_assert_eq!(tree.leaf_order(), chosen_order);

    if options.refine && options.window > 1 {
        refine(tree, rf, options);
    }
    tree.leaf_order()
}

/// Flip subtrees while doing so keeps the one-neighbor SARF and lowers the
/// windowed SARF.
fn refine(tree: &mut ClusterTree, rf: ArrayView2<f64>, options: &OrderOptions) {
    let mut order = tree.leaf_order();
    let mut position = vec![0usize; order.len()];
    for (p, &leaf) in order.iter().enumerate() {
        position[leaf] = p;
    }
    let mut adjacent = window_cost(rf, &order, 1);
    let mut wide = window_cost(rf, &order, options.window);

    let root = tree.root();
    let candidates: Vec<NodeId> = tree.merges().filter(|&v| v != root).collect();
    for pass in 0..options.max_passes {
        let mut improved = false;
        for &v in &candidates {
            let block = tree.leaves(v);
            let start = block.iter().map(|&x| position[x]).min().unwrap_or(0);
            let end = start + block.len();

            let mut candidate = order.clone();
            candidate[start..end].reverse();
            let c1 = window_cost(rf, &candidate, 1);
            if c1 > adjacent + options.tolerance {
                continue;
            }
            let cw = window_cost(rf, &candidate, options.window);
            if cw < wide - options.tolerance {
                tree.flip(v);
                for (p, &leaf) in candidate.iter().enumerate().take(end).skip(start) {
                    position[leaf] = p;
                }
                order = candidate;
                adjacent = c1;
                wide = cw;
                improved = true;
            }
        }
        debug!(pass, sarf = adjacent, window_sarf = wide, "refinement pass");
        if !improved {
            break;
        }
    }
}

/// Order the markers at `members` (indices into `rf`).
///
/// Returns indices into `rf`. Zero, one, or two members need no search.
pub fn order_markers(
    rf: &RfMatrix,
    members: &[usize],
    options: &OrderOptions,
) -> Result<Vec<usize>, PergolaError> {
    let mut seen = vec![false; rf.len()];
    for &m in members {
        if m >= rf.len() || seen[m] {
            return Err(PergolaError::InvalidInput(format!(
                "group member {} is out of range or repeated",
                m
            )));
        }
        seen[m] = true;
    }
    if members.len() <= 2 {
        return Ok(members.to_vec());
    }

    let sub = rf.submatrix(members)?;
    let mut tree = ClusterTree::build(&sub, options.linkage)?;
    let local = optimal_leaf_order(&mut tree, sub.view(), options);
    Ok(local.into_iter().map(|i| members[i]).collect())
}

/// The ordered markers of one linkage group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOrder {
    pub group: GroupId,
    /// Indices into the RF matrix, in map order.
    pub order: Vec<usize>,
    pub marker_ids: Vec<String>,
    /// One-neighbor SARF of the order.
    pub sarf: f64,
    /// SARF over the configured window.
    pub window_sarf: f64,
}

impl GroupOrder {
    fn new(rf: &RfMatrix, group: GroupId, order: Vec<usize>, window: usize) -> Self {
        let sarf = window_cost(rf.view(), &order, 1);
        let window_sarf = window_cost(rf.view(), &order, window);
        let marker_ids = order.iter().map(|&i| rf.marker_ids[i].clone()).collect();
        Self {
            group,
            order,
            marker_ids,
            sarf,
            window_sarf,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// RF values between consecutive markers of the order.
    pub fn adjacent_rf(&self, rf: &RfMatrix) -> Vec<f64> {
        self.order
            .windows(2)
            .map(|pair| rf.get(pair[0], pair[1]))
            .collect()
    }

    /// The group's RF submatrix with rows and columns in map order.
    pub fn reordered_rf(&self, rf: &RfMatrix) -> Result<RfMatrix, PergolaError> {
        rf.submatrix(&self.order)
    }
}

/// Order every assigned linkage group, in parallel across groups.
///
/// Groups are returned in ascending group id; unassigned markers are skipped.
pub fn order_groups(
    rf: &RfMatrix,
    groups: &GroupAssignment,
    options: &OrderOptions,
) -> Result<Vec<GroupOrder>, PergolaError> {
    groups.check_matches(rf)?;
    let orders = groups
        .group_ids()
        .par_iter()
        .map(|&g| {
            let members = groups.members(g);
            let order = order_markers(rf, &members, options)?;
            Ok(GroupOrder::new(rf, g, order, options.window))
        })
        .collect::<Result<Vec<_>, PergolaError>>()?;
    for o in &orders {
        info!(
            group = o.group,
            markers = o.len(),
            sarf = o.sarf,
            window_sarf = o.window_sarf,
            "ordered linkage group"
        );
    }
    Ok(orders)
}

/// Write one row per marker: group, rank within the group, marker id.
pub fn write_orders_tsv(orders: &[GroupOrder], filepath: Option<&str>) -> Result<(), PergolaError> {
    let mut writer = writer_or_stdout(filepath, None)?;
    writeln!(writer, "group\trank\tmarker\tsarf")?;
    for o in orders {
        for (rank, marker) in o.marker_ids.iter().enumerate() {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}",
                o.group,
                rank + 1,
                marker,
                format_float(o.sarf)
            )?;
        }
    }
    writer.finish()?;
    Ok(())
}
