//! # Equal Risk Contribution
//!
//! $$
//! \min_{\mathbf{x} > 0}\ \tfrac12\,\mathbf{x}^\top \Sigma \mathbf{x}
//!   - \frac{1}{n} \sum_i \ln x_i,
//! \qquad \mathbf{w} = \mathbf{x} / \mathbf{1}^\top \mathbf{x}
//! $$
//!
//! At the optimum `x_i (Sigma x)_i = 1/n` for every asset, so the normalized
//! weights carry equal shares of portfolio risk.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::solver::neldermead::NelderMead;
use tracing::debug;
use tracing::warn;

use super::data::dot;
use super::data::mat_vec_mul;
use super::metrics::risk_contributions;
use super::optimizers::OptimizerConfig;
use super::risk_model::RiskModel;
use super::types::Deadline;
use super::types::StrategyKind;
use super::types::WeightVector;
use crate::error::PortfolioError;
use crate::error::Result;

const VAR_EPS: f64 = 1e-14;

/// Relative spread `(max - min) / mean` of the risk contributions of `w`.
pub fn contribution_spread(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
  let rc = risk_contributions(weights, cov);
  let mean = rc.iter().sum::<f64>() / rc.len().max(1) as f64;
  if mean <= 0.0 {
    return f64::INFINITY;
  }
  let (lo, hi) = rc
    .iter()
    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
      (lo.min(r), hi.max(r))
    });
  (hi - lo) / mean
}

fn softmax(x: &[f64]) -> Vec<f64> {
  let max_x = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
  let exps: Vec<f64> = x.iter().map(|&v| (v - max_x).exp()).collect();
  let sum: f64 = exps.iter().sum();

  if sum < 1e-15 || !sum.is_finite() {
    vec![1.0 / x.len() as f64; x.len()]
  } else {
    exps.iter().map(|&e| e / sum).collect()
  }
}

fn normalize(x: &[f64]) -> Vec<f64> {
  let total: f64 = x.iter().sum();
  x.iter().map(|v| v / total).collect()
}

struct RiskParityCost {
  cov: Vec<Vec<f64>>,
  deadline: Deadline,
}

impl CostFunction for RiskParityCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    if self.deadline.expired() {
      return Err(argmin::core::Error::msg("deadline passed"));
    }
    let w = softmax(x);
    let sigma_w = mat_vec_mul(&self.cov, &w);
    let port_var = dot(&w, &sigma_w);
    if port_var < 1e-30 {
      return Ok(1e10);
    }

    let target = 1.0 / w.len() as f64;
    Ok(
      w.iter()
        .zip(sigma_w.iter())
        .map(|(wi, swi)| (wi * swi / port_var - target).powi(2))
        .sum(),
    )
  }
}

/// Nelder-Mead on softmax parameters, started from `start`.
///
/// Every cost evaluation checks `deadline`; an aborted run reports `TimedOut`.
fn polish(
  cov: &[Vec<f64>],
  start: &[f64],
  max_iters: u64,
  deadline: &Deadline,
) -> Result<Option<Vec<f64>>> {
  let n = start.len();
  let x0: Vec<f64> = start.iter().map(|w| w.max(1e-12).ln()).collect();

  let mut simplex = Vec::with_capacity(n + 1);
  simplex.push(x0.clone());
  for i in 0..n {
    let mut point = x0.clone();
    point[i] += 0.25;
    simplex.push(point);
  }

  let Ok(solver) = NelderMead::new(simplex).with_sd_tolerance(1e-14) else {
    return Ok(None);
  };
  let cost = RiskParityCost {
    cov: cov.to_vec(),
    deadline: *deadline,
  };
  match Executor::new(cost, solver)
    .configure(|state| state.max_iters(max_iters))
    .run()
  {
    Ok(res) => Ok(res.state.best_param.map(|x| softmax(&x))),
    Err(err) => {
      deadline.check(StrategyKind::RiskParity)?;
      debug!(error = %err, "risk parity polish aborted");
      Ok(None)
    }
  }
}

/// Equal-risk-contribution weights.
///
/// Cyclical coordinate descent on the log-barrier objective, each coordinate
/// set to the positive root of `Sigma_ii x_i^2 + s_i x_i - 1/n = 0`. When the
/// sweep cap is hit without reaching `risk_parity_tolerance`, a Nelder-Mead
/// polish gets one more chance before the solve is reported as failed.
pub fn optimize_risk_parity(
  model: &RiskModel,
  config: &OptimizerConfig,
  deadline: &Deadline,
) -> Result<WeightVector> {
  let strategy = StrategyKind::RiskParity;
  let cov = model.covariance();
  let n = cov.len();

  if let Some(i) = (0..n).find(|&i| cov[i][i] <= VAR_EPS) {
    warn!(ticker = %model.tickers()[i], "riskless asset has no finite risk-parity weight");
    return Err(PortfolioError::ConvergenceFailure {
      strategy,
      iterations: 0,
      spread: f64::INFINITY,
    });
  }

  let budget = 1.0 / n as f64;
  let mut x: Vec<f64> = (0..n).map(|i| 1.0 / cov[i][i].sqrt()).collect();
  let scale = (budget / dot(&x, &mat_vec_mul(cov, &x)).max(VAR_EPS)).sqrt();
  x.iter_mut().for_each(|v| *v *= scale);

  let mut spread = contribution_spread(&normalize(&x), cov);
  for sweep in 0..config.risk_parity_max_sweeps {
    if spread < config.risk_parity_tolerance {
      debug!(sweeps = sweep, spread, "risk parity converged");
      return WeightVector::from_raw(x);
    }
    deadline.check(strategy)?;

    for i in 0..n {
      let s: f64 = (0..n).filter(|&j| j != i).map(|j| cov[i][j] * x[j]).sum();
      let a = cov[i][i];
      x[i] = (-s + (s * s + 4.0 * a * budget).sqrt()) / (2.0 * a);
    }
    spread = contribution_spread(&normalize(&x), cov);
  }

  if spread < config.risk_parity_tolerance {
    return WeightVector::from_raw(x);
  }

  deadline.check(strategy)?;
  let start = normalize(&x);
  if let Some(w) = polish(cov, &start, config.risk_parity_polish_iters, deadline)? {
    let polished = contribution_spread(&w, cov);
    debug!(before = spread, after = polished, "risk parity polish finished");
    if polished < config.risk_parity_tolerance {
      return WeightVector::from_raw(w);
    }
    spread = spread.min(polished);
  }

  warn!(
    sweeps = config.risk_parity_max_sweeps,
    spread, "risk parity did not converge"
  );
  Err(PortfolioError::ConvergenceFailure {
    strategy,
    iterations: config.risk_parity_max_sweeps,
    spread,
  })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::risk_model::RiskModelConfig;
  use crate::portfolio::types::Asset;

  fn three_assets() -> RiskModel {
    RiskModel::build(
      &[
        Asset::new("LOW", 0.06, 0.10, 1.0).with_correlation_hint(0.2),
        Asset::new("MID", 0.09, 0.20, 1.0).with_correlation_hint(0.4),
        Asset::new("HIGH", 0.14, 0.35, 1.0).with_correlation_hint(0.6),
      ],
      &RiskModelConfig::default(),
    )
    .unwrap()
  }

  #[test]
  fn contributions_are_equal_at_convergence() {
    let model = three_assets();
    let w = optimize_risk_parity(&model, &OptimizerConfig::default(), &Deadline::none()).unwrap();

    let rc = risk_contributions(&w, model.covariance());
    let mean = rc.iter().sum::<f64>() / rc.len() as f64;
    for r in &rc {
      assert!((r - mean).abs() <= 0.01 * mean, "contributions {rc:?}");
    }
    assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    assert!(w[0] > w[1] && w[1] > w[2], "lower risk gets more weight: {w:?}");
  }

  #[test]
  fn two_assets_reduce_to_inverse_volatility() {
    let model = RiskModel::build(
      &[
        Asset::new("NVDA", 0.15, 0.207, 120.0),
        Asset::new("AAPL", 0.12, 0.25, 190.0),
      ],
      &RiskModelConfig::default(),
    )
    .unwrap();
    let w = optimize_risk_parity(&model, &OptimizerConfig::default(), &Deadline::none()).unwrap();
    let total = 1.0 / 0.207 + 1.0 / 0.25;

    assert_abs_diff_eq!(w[0], (1.0 / 0.207) / total, epsilon = 1e-6);
  }

  #[test]
  fn zero_sweeps_without_polish_reports_failure() {
    let model = three_assets();
    let config = OptimizerConfig {
      risk_parity_max_sweeps: 0,
      risk_parity_polish_iters: 0,
      ..Default::default()
    };

    match optimize_risk_parity(&model, &config, &Deadline::none()) {
      Err(PortfolioError::ConvergenceFailure {
        strategy, spread, ..
      }) => {
        assert_eq!(strategy, StrategyKind::RiskParity);
        assert!(spread > config.risk_parity_tolerance);
      }
      other => panic!("expected convergence failure, got {other:?}"),
    }
  }

  #[test]
  fn polish_stops_at_the_deadline() {
    let model = three_assets();
    let start = [0.6, 0.3, 0.1];

    assert_eq!(
      polish(
        model.covariance(),
        &start,
        5_000,
        &Deadline::at(std::time::Instant::now())
      ),
      Err(PortfolioError::TimedOut {
        strategy: StrategyKind::RiskParity
      })
    );
    let w = polish(model.covariance(), &start, 5_000, &Deadline::none())
      .unwrap()
      .unwrap();
    let cov = model.covariance();
    assert!(contribution_spread(&w, cov) < contribution_spread(&start, cov));
  }

  #[test]
  fn riskless_asset_cannot_be_balanced() {
    let model = RiskModel::build(
      &[
        Asset::new("CASH", 0.03, 0.0, 1.0),
        Asset::new("AAPL", 0.12, 0.25, 190.0),
      ],
      &RiskModelConfig::default(),
    )
    .unwrap();

    let err = optimize_risk_parity(&model, &OptimizerConfig::default(), &Deadline::none())
      .unwrap_err();
    assert!(err.is_recoverable());
  }

  #[test]
  fn spread_of_equal_contributions_is_zero() {
    let cov = vec![vec![0.04, 0.0], vec![0.0, 0.04]];
    assert_abs_diff_eq!(contribution_spread(&[0.5, 0.5], &cov), 0.0, epsilon = 1e-12);
    assert!(contribution_spread(&[0.9, 0.1], &cov) > 1.0);
  }
}
