//! # Portfolio Optimizers
//!
//! $$
//! \min_{\mathbf{y} \ge 0}\ \mathbf{y}^\top Q \mathbf{y}
//! \quad \text{s.t.}\quad \mathbf{e}^\top \mathbf{y} = 1,
//! \qquad \mathbf{w} = \mathbf{y} / \mathbf{1}^\top \mathbf{y}
//! $$
//!
//! Long-only, fully invested allocation strategies. Maximum Sharpe, minimum
//! variance and maximum diversification all reduce to the quadratic program
//! above with a different `(Q, e)` pair; risk parity and HRP live in their own
//! modules.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::data::dot;
use super::data::mat_vec_mul;
use super::hrp::Linkage;
use super::hrp::optimize_hrp;
use super::risk_model::RiskModel;
use super::risk_model::largest_eigenvalue;
use super::risk_parity::optimize_risk_parity;
use super::types::Deadline;
use super::types::SolveStatus;
use super::types::StrategyKind;
use super::types::WeightVector;
use crate::error::PortfolioError;
use crate::error::Result;

/// Solver settings shared by every strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
  /// Risk-free rate used for excess returns.
  pub risk_free: f64,
  /// Iteration cap of the quadratic-program solver.
  pub qp_max_iters: usize,
  /// Step-size tolerance of the quadratic-program solver.
  pub qp_tolerance: f64,
  /// Maximum relative spread of risk contributions accepted as converged.
  pub risk_parity_tolerance: f64,
  /// Sweep cap of the risk-parity coordinate descent.
  pub risk_parity_max_sweeps: usize,
  /// Iteration cap of the Nelder-Mead polish after coordinate descent.
  pub risk_parity_polish_iters: u64,
  /// Cluster linkage used by HRP.
  pub linkage: Linkage,
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      risk_free: 0.0,
      qp_max_iters: 20_000,
      qp_tolerance: 1e-12,
      risk_parity_tolerance: 1e-6,
      risk_parity_max_sweeps: 500,
      risk_parity_polish_iters: 5_000,
      linkage: Linkage::Single,
    }
  }
}

/// Reason recorded when the quadratic program stops short of its tolerance.
pub const QP_ITERATION_CAP: &str = "quadratic program stopped at its iteration cap";

/// Weights together with how the solver reached them.
pub type Solved = (WeightVector, SolveStatus);

/// Solution of [`solve_simplex_qp`].
#[derive(Clone, Debug)]
pub(crate) struct QpSolution {
  pub y: Vec<f64>,
  pub converged: bool,
}

impl QpSolution {
  /// Normalize onto the simplex; an unconverged solve comes back degraded.
  fn into_weights(self, strategy: StrategyKind) -> Result<Solved> {
    let status = if self.converged {
      SolveStatus::Optimal
    } else {
      warn!(%strategy, "{QP_ITERATION_CAP}");
      SolveStatus::Degraded {
        reason: QP_ITERATION_CAP.to_string(),
      }
    };
    Ok((WeightVector::from_raw(self.y)?, status))
  }
}

/// Euclidean projection of `v` onto `{y >= 0, e'y = 1}`.
///
/// `y_i = max(0, v_i + lambda e_i)` with the multiplier found by bisection;
/// `e` needs at least one positive entry.
pub(crate) fn project_onto_budget(v: &[f64], e: &[f64]) -> Vec<f64> {
  let budget = |lambda: f64| -> f64 {
    v.iter()
      .zip(e.iter())
      .map(|(vi, ei)| ei * (vi + lambda * ei).max(0.0))
      .sum()
  };

  let mut lo = -1.0;
  let mut hi = 1.0;
  for _ in 0..200 {
    if budget(hi) >= 1.0 {
      break;
    }
    hi *= 2.0;
  }
  for _ in 0..200 {
    if budget(lo) <= 1.0 {
      break;
    }
    lo *= 2.0;
  }

  for _ in 0..200 {
    let mid = 0.5 * (lo + hi);
    if mid <= lo || mid >= hi {
      break;
    }
    if budget(mid) < 1.0 {
      lo = mid;
    } else {
      hi = mid;
    }
  }

  let lambda = 0.5 * (lo + hi);
  v.iter()
    .zip(e.iter())
    .map(|(vi, ei)| (vi + lambda * ei).max(0.0))
    .collect()
}

/// Accelerated projected gradient for `min y'Qy s.t. y >= 0, e'y = 1`.
///
/// Step `1 / (2 lambda_max(Q))`, momentum restarted whenever the objective rises.
pub(crate) fn solve_simplex_qp(
  q: &[Vec<f64>],
  e: &[f64],
  config: &OptimizerConfig,
  deadline: &Deadline,
  strategy: StrategyKind,
) -> Result<QpSolution> {
  let n = q.len();
  let objective = |y: &[f64]| dot(y, &mat_vec_mul(q, y));

  let mut y = project_onto_budget(&vec![0.0; n], e);
  let lmax = largest_eigenvalue(q);
  if lmax <= 1e-300 {
    return Ok(QpSolution { y, converged: true });
  }

  let step = 1.0 / (2.0 * lmax);
  let mut z = y.clone();
  let mut t = 1.0_f64;
  let mut f_y = objective(&y);

  for iter in 0..config.qp_max_iters {
    if iter % 64 == 0 {
      deadline.check(strategy)?;
    }

    let grad = mat_vec_mul(q, &z);
    let shifted: Vec<f64> = z
      .iter()
      .zip(grad.iter())
      .map(|(zi, gi)| zi - 2.0 * step * gi)
      .collect();
    let y_next = project_onto_budget(&shifted, e);
    let f_next = objective(&y_next);

    let delta = y_next
      .iter()
      .zip(y.iter())
      .fold(0.0_f64, |m, (a, b)| m.max((a - b).abs()));

    if f_next > f_y {
      t = 1.0;
      z = y_next.clone();
    } else {
      let t_next = 0.5 * (1.0 + (1.0 + 4.0 * t * t).sqrt());
      let momentum = (t - 1.0) / t_next;
      z = y_next
        .iter()
        .zip(y.iter())
        .map(|(a, b)| a + momentum * (a - b))
        .collect();
      t = t_next;
    }

    y = y_next;
    f_y = f_next;

    if delta < config.qp_tolerance {
      debug!(%strategy, iterations = iter + 1, "quadratic program converged");
      return Ok(QpSolution { y, converged: true });
    }
  }

  Ok(QpSolution {
    y,
    converged: false,
  })
}

/// Closed-form long-only minimum variance for two assets.
///
/// `w_1 = (s_2^2 - s_12) / (s_1^2 + s_2^2 - 2 s_12)`, clamped to `[0, 1]`.
/// `None` when the two assets are perfectly collinear.
pub fn two_asset_min_variance(cov: &[Vec<f64>]) -> Option<[f64; 2]> {
  if cov.len() != 2 {
    return None;
  }
  let (a, b, c) = (cov[0][0], cov[1][1], cov[0][1]);
  let denom = a + b - 2.0 * c;
  if denom <= 1e-14 {
    return None;
  }
  let w0 = ((b - c) / denom).clamp(0.0, 1.0);
  Some([w0, 1.0 - w0])
}

/// Global minimum-variance weights from the general quadratic program.
pub fn min_variance_qp(
  cov: &[Vec<f64>],
  config: &OptimizerConfig,
  deadline: &Deadline,
) -> Result<Solved> {
  let ones = vec![1.0; cov.len()];
  solve_simplex_qp(cov, &ones, config, deadline, StrategyKind::MinVariance)?
    .into_weights(StrategyKind::MinVariance)
}

/// Long-only global minimum-variance portfolio.
pub fn optimize_min_variance(
  model: &RiskModel,
  config: &OptimizerConfig,
  deadline: &Deadline,
) -> Result<Solved> {
  match two_asset_min_variance(model.covariance()) {
    Some(w) => Ok((WeightVector::new(w.to_vec())?, SolveStatus::Optimal)),
    None => min_variance_qp(model.covariance(), config, deadline),
  }
}

/// Long-only maximum Sharpe (tangency) portfolio.
///
/// Solves `min y'Sigma y s.t. y'(mu - r_f) = 1, y >= 0` and rescales `y`
/// onto the simplex.
pub fn optimize_max_sharpe(
  model: &RiskModel,
  config: &OptimizerConfig,
  deadline: &Deadline,
) -> Result<Solved> {
  let excess = model.excess_returns(config.risk_free);
  if excess.iter().all(|&e| e <= 0.0) {
    return Err(PortfolioError::DegenerateProblem {
      strategy: StrategyKind::MaxSharpe,
      reason: format!(
        "no asset beats the risk-free rate of {:.2}%",
        config.risk_free * 100.0
      ),
    });
  }

  solve_simplex_qp(
    model.covariance(),
    &excess,
    config,
    deadline,
    StrategyKind::MaxSharpe,
  )?
  .into_weights(StrategyKind::MaxSharpe)
}

/// Long-only maximum diversification portfolio.
///
/// With `z = sigma * y`, maximizing `(w'sigma) / sqrt(w'Sigma w)` is the
/// minimum-variance problem on the correlation matrix; weights are rescaled
/// back by `1 / sigma`.
pub fn optimize_max_diversification(
  model: &RiskModel,
  config: &OptimizerConfig,
  deadline: &Deadline,
) -> Result<Solved> {
  let sigmas = model.volatilities();
  if let Some(i) = sigmas.iter().position(|&s| s <= 1e-12) {
    return Err(PortfolioError::DegenerateProblem {
      strategy: StrategyKind::MaxDiversification,
      reason: format!(
        "{} has zero volatility, diversification ratio is unbounded",
        model.tickers()[i]
      ),
    });
  }

  let ones = vec![1.0; sigmas.len()];
  let sol = solve_simplex_qp(
    model.correlation(),
    &ones,
    config,
    deadline,
    StrategyKind::MaxDiversification,
  )?;
  let rescaled = QpSolution {
    y: sol.y.iter().zip(sigmas.iter()).map(|(z, s)| z / s).collect(),
    converged: sol.converged,
  };
  rescaled.into_weights(StrategyKind::MaxDiversification)
}

/// Inverse-volatility heuristic allocation.
///
/// Zero-volatility assets get no weight; if every asset is riskless the
/// allocation is equal.
pub fn optimize_inverse_vol(model: &RiskModel) -> Result<WeightVector> {
  let inv_vols: Vec<f64> = model
    .volatilities()
    .iter()
    .map(|&sigma| if sigma > 1e-15 { 1.0 / sigma } else { 0.0 })
    .collect();

  if inv_vols.iter().sum::<f64>() > 1e-15 {
    WeightVector::from_raw(inv_vols)
  } else {
    WeightVector::equal(model.len())
  }
}

/// Dispatch to the selected strategy.
///
/// The status is [`SolveStatus::Degraded`] when an iterative solver returned
/// its best iterate without converging.
pub fn optimize_with_method(
  method: StrategyKind,
  model: &RiskModel,
  config: &OptimizerConfig,
  deadline: &Deadline,
) -> Result<Solved> {
  deadline.check(method)?;
  let optimal = |weights: WeightVector| (weights, SolveStatus::Optimal);
  match method {
    StrategyKind::MaxSharpe => optimize_max_sharpe(model, config, deadline),
    StrategyKind::MinVariance => optimize_min_variance(model, config, deadline),
    StrategyKind::RiskParity => optimize_risk_parity(model, config, deadline).map(optimal),
    StrategyKind::MaxDiversification => optimize_max_diversification(model, config, deadline),
    StrategyKind::HierarchicalRiskParity => optimize_hrp(model, config, deadline).map(optimal),
  }
}
