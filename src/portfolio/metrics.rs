//! # Portfolio Metrics
//!
//! $$
//! \mathrm{VaR}_c = \mu_p - z_c\,\sigma_p,\qquad
//! \mathrm{CVaR}_c = \mu_p - \sigma_p\,\frac{\varphi(z_c)}{1-c}
//! $$
//!
//! Single-period risk and return figures of a weight vector under a normal
//! return assumption.

use serde::Deserialize;
use serde::Serialize;
use statrs::distribution::Continuous;
use statrs::distribution::ContinuousCDF;
use statrs::distribution::Normal;

use super::data::dot;
use super::data::mat_vec_mul;
use super::risk_model::RiskModel;
use crate::error::PortfolioError;
use crate::error::Result;

const VOL_EPS: f64 = 1e-15;

/// Settings for [`evaluate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
  /// Risk-free rate for Sharpe ratios.
  pub risk_free: f64,
  /// Confidence level for VaR and CVaR.
  pub confidence: f64,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      risk_free: 0.0,
      confidence: 0.95,
    }
  }
}

impl MetricsConfig {
  /// Confidence must lie in `(0.5, 1)` and the risk-free rate must be finite.
  pub fn validate(&self) -> Result<()> {
    let c = self.confidence;
    if !(c > 0.5 && c < 1.0) {
      return Err(PortfolioError::invalid(
        "metrics.confidence",
        format!("{c} is outside (0.5, 1)"),
      ));
    }
    if !self.risk_free.is_finite() {
      return Err(PortfolioError::invalid("metrics.risk_free", "must be finite"));
    }
    Ok(())
  }
}

/// Risk and return figures of one weight vector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
  /// `w' mu`.
  pub expected_return: f64,
  /// `sqrt(w' Sigma w)`.
  pub volatility: f64,
  /// `None` when volatility is zero.
  pub sharpe: Option<f64>,
  /// Parametric value at risk, as a return quantile.
  pub value_at_risk: f64,
  /// Parametric expected shortfall, as a return.
  pub conditional_value_at_risk: f64,
  /// Weighted per-asset max drawdown. Illustrative only: it is neither a
  /// bound nor an estimate of the portfolio's own drawdown.
  pub max_drawdown: Option<f64>,
  /// `(w' sigma) / sigma_p`.
  pub diversification_ratio: Option<f64>,
  /// `1 / sum(w_i^2)`.
  pub effective_assets: f64,
  /// Fraction of portfolio volatility contributed by each asset.
  pub risk_contributions: Vec<f64>,
}

/// Standard normal quantile for a one-sided confidence level.
pub fn z_score(confidence: f64) -> f64 {
  Normal::standard().inverse_cdf(confidence)
}

/// `mu - z_c * sigma`.
pub fn parametric_var(expected_return: f64, volatility: f64, confidence: f64) -> f64 {
  expected_return - z_score(confidence) * volatility
}

/// `mu - sigma * phi(z_c) / (1 - c)`.
pub fn parametric_cvar(expected_return: f64, volatility: f64, confidence: f64) -> f64 {
  let n = Normal::standard();
  let z = n.inverse_cdf(confidence);
  expected_return - volatility * n.pdf(z) / (1.0 - confidence)
}

/// Per-asset share of portfolio volatility, `w_i (Sigma w)_i / (w' Sigma w)`.
///
/// All zeros for a zero-variance portfolio.
pub fn risk_contributions(weights: &[f64], cov: &[Vec<f64>]) -> Vec<f64> {
  let sigma_w = mat_vec_mul(cov, weights);
  let var = dot(weights, &sigma_w);
  if var <= VOL_EPS * VOL_EPS {
    return vec![0.0; weights.len()];
  }
  weights
    .iter()
    .zip(sigma_w.iter())
    .map(|(w, sw)| w * sw / var)
    .collect()
}

/// Evaluate a weight vector against the risk model.
pub fn evaluate(
  weights: &[f64],
  model: &RiskModel,
  config: &MetricsConfig,
) -> Result<PortfolioMetrics> {
  config.validate()?;
  let expected_return = dot(weights, model.expected_returns());
  let volatility = model.portfolio_volatility(weights);

  let sharpe = (volatility > VOL_EPS).then(|| (expected_return - config.risk_free) / volatility);
  let diversification_ratio =
    (volatility > VOL_EPS).then(|| dot(weights, model.volatilities()) / volatility);

  let max_drawdown = model
    .assets()
    .iter()
    .zip(weights.iter())
    .map(|(a, w)| a.max_drawdown.map(|mdd| w * mdd))
    .sum::<Option<f64>>();

  let hhi: f64 = weights.iter().map(|w| w * w).sum();
  let effective_assets = if hhi > 0.0 { 1.0 / hhi } else { 0.0 };

  Ok(PortfolioMetrics {
    expected_return,
    volatility,
    sharpe,
    value_at_risk: parametric_var(expected_return, volatility, config.confidence),
    conditional_value_at_risk: parametric_cvar(expected_return, volatility, config.confidence),
    max_drawdown,
    diversification_ratio,
    effective_assets,
    risk_contributions: risk_contributions(weights, model.covariance()),
  })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::risk_model::RiskModelConfig;
  use crate::portfolio::types::Asset;

  fn model(assets: Vec<Asset>) -> RiskModel {
    RiskModel::build(&assets, &RiskModelConfig::default()).unwrap()
  }

  #[test]
  fn var_and_cvar_use_normal_quantiles() {
    assert_abs_diff_eq!(z_score(0.95), 1.645, epsilon = 1e-3);
    assert_abs_diff_eq!(
      parametric_var(0.1, 0.2, 0.95),
      0.1 - 1.6449 * 0.2,
      epsilon = 1e-4
    );
    // phi(1.645) / 0.05 ~ 2.0627
    assert_abs_diff_eq!(
      parametric_cvar(0.1, 0.2, 0.95),
      0.1 - 0.2 * 2.0627,
      epsilon = 1e-3
    );
    assert!(parametric_cvar(0.1, 0.2, 0.95) < parametric_var(0.1, 0.2, 0.95));
  }

  #[test]
  fn sample_pair_metrics() {
    let m = model(vec![
      Asset::new("NVDA", 0.15, 0.207, 120.0),
      Asset::new("AAPL", 0.12, 0.25, 190.0),
    ]);
    let w = [0.5, 0.5];
    let metrics = evaluate(&w, &m, &MetricsConfig::default()).unwrap();

    let var = 0.25 * 0.207f64.powi(2) + 0.25 * 0.0625 + 2.0 * 0.25 * 0.7 * 0.207 * 0.25;
    assert_abs_diff_eq!(metrics.expected_return, 0.135, epsilon = 1e-12);
    assert_abs_diff_eq!(metrics.volatility, var.sqrt(), epsilon = 1e-12);
    assert_abs_diff_eq!(metrics.sharpe.unwrap(), 0.135 / var.sqrt(), epsilon = 1e-12);
    assert_abs_diff_eq!(metrics.effective_assets, 2.0, epsilon = 1e-12);
    assert!(metrics.diversification_ratio.unwrap() >= 1.0);
    assert_abs_diff_eq!(
      metrics.risk_contributions.iter().sum::<f64>(),
      1.0,
      epsilon = 1e-12
    );
    assert!(metrics.max_drawdown.is_none());
  }

  #[test]
  fn zero_volatility_reports_no_sharpe() {
    let m = model(vec![
      Asset::new("CASH", 0.03, 0.0, 1.0),
      Asset::new("BILL", 0.04, 0.0, 1.0),
    ]);
    let metrics = evaluate(&[0.5, 0.5], &m, &MetricsConfig::default()).unwrap();

    assert_eq!(metrics.volatility, 0.0);
    assert!(metrics.sharpe.is_none());
    assert!(metrics.diversification_ratio.is_none());
    assert_eq!(metrics.risk_contributions, vec![0.0, 0.0]);
    assert_abs_diff_eq!(metrics.value_at_risk, 0.035, epsilon = 1e-12);
  }

  #[test]
  fn out_of_range_confidence_is_rejected() {
    let m = model(vec![
      Asset::new("AAA", 0.1, 0.2, 1.0),
      Asset::new("BBB", 0.1, 0.2, 1.0),
    ]);

    for confidence in [1.0, 0.5, f64::NAN] {
      let config = MetricsConfig {
        confidence,
        ..Default::default()
      };
      assert!(matches!(
        evaluate(&[0.5, 0.5], &m, &config),
        Err(PortfolioError::InvalidInput { .. })
      ));
    }
  }

  #[test]
  fn drawdown_is_weighted_only_when_complete() {
    let full = model(vec![
      Asset::new("AAA", 0.1, 0.2, 1.0).with_max_drawdown(0.3),
      Asset::new("BBB", 0.1, 0.2, 1.0).with_max_drawdown(0.5),
    ]);
    let metrics = evaluate(&[0.25, 0.75], &full, &MetricsConfig::default()).unwrap();
    assert_abs_diff_eq!(metrics.max_drawdown.unwrap(), 0.45, epsilon = 1e-12);

    let partial = model(vec![
      Asset::new("AAA", 0.1, 0.2, 1.0).with_max_drawdown(0.3),
      Asset::new("BBB", 0.1, 0.2, 1.0),
    ]);
    let metrics = evaluate(&[0.25, 0.75], &partial, &MetricsConfig::default()).unwrap();
    assert!(metrics.max_drawdown.is_none());
  }
}
