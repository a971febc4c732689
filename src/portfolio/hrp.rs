//! # Hierarchical Risk Parity
//!
//! $$
//! d_{ij} = \sqrt{\tfrac12 (1 - \rho_{ij})},\qquad
//! \alpha = 1 - \frac{V_L}{V_L + V_R}
//! $$
//!
//! Agglomerative clustering on the correlation distance, then top-down
//! allocation along the dendrogram: each split gives the left cluster `alpha`
//! of its parent's weight, where `V` is the inverse-variance cluster variance.

use ordered_float::OrderedFloat;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::optimizers::OptimizerConfig;
use super::risk_model::RiskModel;
use super::types::Deadline;
use super::types::StrategyKind;
use super::types::WeightVector;
use crate::error::PortfolioError;
use crate::error::Result;

/// Distance between two clusters as a function of their members' distances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
  /// Nearest pair of members.
  #[default]
  Single,
  /// Size-weighted mean over all member pairs (UPGMA).
  Average,
}

/// One agglomeration step. Node ids below `n` are leaves (asset indices),
/// id `n + k` is the cluster formed by merge `k`.
#[derive(Clone, Debug, PartialEq)]
pub struct Merge {
  pub left: usize,
  pub right: usize,
  pub height: f64,
  pub size: usize,
}

/// Binary merge tree over `n` leaves.
#[derive(Clone, Debug, PartialEq)]
pub struct Dendrogram {
  n: usize,
  merges: Vec<Merge>,
}

impl Dendrogram {
  pub fn leaves(&self) -> usize {
    self.n
  }

  pub fn merges(&self) -> &[Merge] {
    &self.merges
  }

  fn root(&self) -> usize {
    if self.merges.is_empty() {
      0
    } else {
      self.n + self.merges.len() - 1
    }
  }

  fn children(&self, node: usize) -> Option<(usize, usize)> {
    node
      .checked_sub(self.n)
      .and_then(|k| self.merges.get(k))
      .map(|m| (m.left, m.right))
  }

  /// Leaves under `node`, left to right.
  pub fn leaves_of(&self, node: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
      match self.children(id) {
        Some((l, r)) => {
          stack.push(r);
          stack.push(l);
        }
        None => out.push(id),
      }
    }
    out
  }

  /// Quasi-diagonal leaf order.
  pub fn order(&self) -> Vec<usize> {
    self.leaves_of(self.root())
  }
}

/// `sqrt((1 - rho) / 2)` for every pair.
pub fn correlation_distance(corr: &[Vec<f64>]) -> Vec<Vec<f64>> {
  corr
    .iter()
    .map(|row| row.iter().map(|c| ((1.0 - c).max(0.0) / 2.0).sqrt()).collect())
    .collect()
}

/// Agglomerative clustering of a distance matrix.
///
/// A merged cluster keeps the slot of its lower-indexed member, so every slot
/// is labelled by the smallest asset index it contains. Equal distances are
/// resolved toward the lexicographically smallest slot pair.
pub fn cluster(
  dist: &[Vec<f64>],
  linkage: Linkage,
  deadline: &Deadline,
) -> Result<Dendrogram> {
  let n = dist.len();
  let mut d = dist.to_vec();
  let mut active = vec![true; n];
  let mut node_id: Vec<usize> = (0..n).collect();
  let mut sizes = vec![1usize; n];
  let mut merges = Vec::with_capacity(n.saturating_sub(1));

  for step in 0..n.saturating_sub(1) {
    deadline.check(StrategyKind::HierarchicalRiskParity)?;

    let live = &active;
    let closest = (0..n)
      .filter(|&i| live[i])
      .flat_map(move |i| ((i + 1)..n).filter(move |&j| live[j]).map(move |j| (i, j)))
      .min_by_key(|&(i, j)| (OrderedFloat(d[i][j]), i, j));
    let Some((mi, mj)) = closest else {
      break;
    };

    let (size_i, size_j) = (sizes[mi], sizes[mj]);
    merges.push(Merge {
      left: node_id[mi],
      right: node_id[mj],
      height: d[mi][mj],
      size: size_i + size_j,
    });
    node_id[mi] = n + step;
    sizes[mi] = size_i + size_j;
    active[mj] = false;

    for k in (0..n).filter(|&k| active[k] && k != mi) {
      let merged = match linkage {
        Linkage::Single => d[mi][k].min(d[mj][k]),
        Linkage::Average => {
          (size_i as f64 * d[mi][k] + size_j as f64 * d[mj][k]) / (size_i + size_j) as f64
        }
      };
      d[mi][k] = merged;
      d[k][mi] = merged;
    }
  }

  Ok(Dendrogram { n, merges })
}

/// Variance of the inverse-variance portfolio over `indices`.
fn cluster_variance(indices: &[usize], cov: &[Vec<f64>]) -> f64 {
  let inv_vars: Vec<f64> = indices
    .iter()
    .map(|&i| if cov[i][i] > 1e-15 { 1.0 / cov[i][i] } else { 0.0 })
    .collect();

  let total: f64 = inv_vars.iter().sum();
  if total < 1e-15 {
    // every member riskless
    return 0.0;
  }

  let w: Vec<f64> = inv_vars.iter().map(|iv| iv / total).collect();
  let mut var = 0.0;
  for (a, &ia) in indices.iter().enumerate() {
    for (b, &ib) in indices.iter().enumerate() {
      var += w[a] * w[b] * cov[ia][ib];
    }
  }
  var.max(0.0)
}

/// Top-down allocation along the dendrogram.
fn bisect(
  tree: &Dendrogram,
  cov: &[Vec<f64>],
  deadline: &Deadline,
) -> Result<Vec<f64>> {
  let n = tree.leaves();
  let mut weights = vec![1.0; n];
  let mut stack = vec![(tree.root(), 0usize)];

  while let Some((node, depth)) = stack.pop() {
    let Some((left, right)) = tree.children(node) else {
      continue;
    };
    if depth >= n {
      return Err(PortfolioError::DegenerateProblem {
        strategy: StrategyKind::HierarchicalRiskParity,
        reason: format!("dendrogram deeper than {n} levels"),
      });
    }
    deadline.check(StrategyKind::HierarchicalRiskParity)?;

    let left_leaves = tree.leaves_of(left);
    let right_leaves = tree.leaves_of(right);
    let var_left = cluster_variance(&left_leaves, cov);
    let var_right = cluster_variance(&right_leaves, cov);

    let denom = var_left + var_right;
    let alpha = if denom > 1e-30 {
      1.0 - var_left / denom
    } else {
      0.5
    };

    for &i in &left_leaves {
      weights[i] *= alpha;
    }
    for &i in &right_leaves {
      weights[i] *= 1.0 - alpha;
    }

    stack.push((right, depth + 1));
    stack.push((left, depth + 1));
  }

  Ok(weights)
}

/// Hierarchical risk parity weights.
pub fn optimize_hrp(
  model: &RiskModel,
  config: &OptimizerConfig,
  deadline: &Deadline,
) -> Result<WeightVector> {
  let dist = correlation_distance(model.correlation());
  let tree = cluster(&dist, config.linkage, deadline)?;
  debug!(order = ?tree.order(), linkage = ?config.linkage, "hrp leaf order");

  let weights = bisect(&tree, model.covariance(), deadline)?;
  WeightVector::from_raw(weights)
}
