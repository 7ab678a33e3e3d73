//! Honest tree: arena of nodes grown on the structure half, with leaves
//! populated from the estimation half.

use hte_core::FeatureMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::split::find_best_split;

/// Borrowed training arrays shared by every tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrainingData<'a> {
    pub x: &'a FeatureMatrix,
    pub y_res: &'a [f64],
    pub t_res: &'a [f64],
    pub treated: &'a [f64],
}

/// Growth limits for one tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeParams {
    pub min_leaf: usize,
    pub max_depth: Option<usize>,
    pub mtry: usize,
    pub honesty_fraction: f64,
}

/// Tree node. Children are indices into the owning tree's node arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Internal node: `x[feature] <= threshold` goes to `left`.
    Split {
        /// Moderator index.
        feature: usize,
        /// Cut point.
        threshold: f64,
        /// Left child.
        left: u32,
        /// Right child.
        right: u32,
    },
    /// Terminal node holding its estimation-half rows.
    Leaf {
        /// Estimation-half training rows in this leaf, ascending.
        samples: Vec<u32>,
        /// Local effect solved on `samples`.
        effect: f64,
        /// `Σ (T̃ - T̄)²` over `samples`, the leaf's precision weight.
        weight: f64,
    },
}

/// One honest tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HonestTree {
    nodes: Vec<Node>,
    /// Training rows drawn for this tree (both halves), ascending.
    subsample: Vec<u32>,
    /// Little-bag group.
    group: u32,
}

impl HonestTree {
    /// Node arena; index 0 is the root.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Little-bag group this tree belongs to.
    pub fn group(&self) -> u32 {
        self.group
    }

    /// Whether training row `i` was drawn for this tree.
    pub fn in_subsample(&self, i: usize) -> bool {
        u32::try_from(i).is_ok_and(|i| self.subsample.binary_search(&i).is_ok())
    }

    /// Index of the leaf `row` falls into.
    pub fn leaf_index(&self, row: &[f64]) -> usize {
        let mut at = 0usize;
        loop {
            match &self.nodes[at] {
                Node::Split { feature, threshold, left, right } => {
                    at = if row[*feature] <= *threshold { *left as usize } else { *right as usize };
                }
                Node::Leaf { .. } => return at,
            }
        }
    }

    /// Estimation rows in the leaf `row` falls into.
    pub fn leaf_samples(&self, row: &[f64]) -> &[u32] {
        match &self.nodes[self.leaf_index(row)] {
            Node::Leaf { samples, .. } => samples,
            Node::Split { .. } => &[],
        }
    }

    /// Number of leaves.
    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }

    /// Split feature of every internal node, tagged with its depth.
    pub fn splits_by_depth(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut stack = vec![(0usize, 0usize)];
        while let Some((at, depth)) = stack.pop() {
            if let Node::Split { feature, left, right, .. } = &self.nodes[at] {
                out.push((depth, *feature));
                stack.push((*left as usize, depth + 1));
                stack.push((*right as usize, depth + 1));
            }
        }
        out
    }
}

/// Local effect and precision on a set of rows.
fn leaf_estimate(data: &TrainingData<'_>, rows: &[u32]) -> (f64, f64) {
    if rows.is_empty() {
        return (f64::NAN, 0.0);
    }
    let n = rows.len() as f64;
    let t_bar = rows.iter().map(|&i| data.t_res[i as usize]).sum::<f64>() / n;
    let y_bar = rows.iter().map(|&i| data.y_res[i as usize]).sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for &i in rows {
        let dt = data.t_res[i as usize] - t_bar;
        num += dt * (data.y_res[i as usize] - y_bar);
        den += dt * dt;
    }
    if den <= 1e-12 { (f64::NAN, 0.0) } else { (num / den, den) }
}

/// Grow one honest tree on `subsample`.
///
/// The subsample is shuffled and cut at `honesty_fraction`: the first part
/// chooses splits, the rest populates leaves. No row serves both roles.
pub(crate) fn grow_tree(
    data: &TrainingData<'_>,
    subsample: Vec<u32>,
    params: &TreeParams,
    group: u32,
    rng: &mut StdRng,
) -> HonestTree {
    let mut shuffled = subsample.clone();
    shuffled.shuffle(rng);
    let n_structure = ((shuffled.len() as f64) * params.honesty_fraction).round() as usize;
    let estimation = shuffled.split_off(n_structure.min(shuffled.len()));
    let structure = shuffled;

    let p = data.x.n_cols();
    let mtry = params.mtry.min(p);
    let mut nodes = vec![Node::Leaf { samples: Vec::new(), effect: f64::NAN, weight: 0.0 }];
    let mut stack = vec![(0usize, structure, estimation, 0usize)];

    while let Some((at, s_rows, e_rows, depth)) = stack.pop() {
        let can_split = mtry > 0 && params.max_depth.is_none_or(|d| depth < d);
        let split = if can_split {
            let features: Vec<usize> = {
                let mut f = rand::seq::index::sample(rng, p, mtry).into_vec();
                f.sort_unstable();
                f
            };
            find_best_split(data, &s_rows, &e_rows, &features, params.min_leaf)
        } else {
            None
        };

        match split {
            Some(c) => {
                let goes_left = |i: &u32| data.x.get(*i as usize, c.feature) <= c.threshold;
                let (s_left, s_right): (Vec<u32>, Vec<u32>) = s_rows.into_iter().partition(goes_left);
                let (e_left, e_right): (Vec<u32>, Vec<u32>) = e_rows.into_iter().partition(goes_left);
                let left = nodes.len();
                nodes.push(Node::Leaf { samples: Vec::new(), effect: f64::NAN, weight: 0.0 });
                let right = nodes.len();
                nodes.push(Node::Leaf { samples: Vec::new(), effect: f64::NAN, weight: 0.0 });
                nodes[at] = Node::Split {
                    feature: c.feature,
                    threshold: c.threshold,
                    left: left as u32,
                    right: right as u32,
                };
                stack.push((right, s_right, e_right, depth + 1));
                stack.push((left, s_left, e_left, depth + 1));
            }
            None => {
                let mut samples = e_rows;
                samples.sort_unstable();
                let (effect, weight) = leaf_estimate(data, &samples);
                nodes[at] = Node::Leaf { samples, effect, weight };
            }
        }
    }

    let mut subsample = subsample;
    subsample.sort_unstable();
    HonestTree { nodes, subsample, group }
}
