//! # Risk Model
//!
//! $$
//! \Sigma = D_\sigma\, P\, D_\sigma,\qquad P \succeq 0
//! $$
//!
//! Validated asset snapshot with its expected-return vector and a positive
//! semi-definite covariance matrix. Correlation comes from return history,
//! per-asset hints or a configured default band, in that order.

use std::collections::HashSet;

use nalgebra::DMatrix;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::data::align_return_series;
use super::data::constant_correlation;
use super::data::corr_from_cov;
use super::data::correlation_matrix;
use super::data::covariance_matrix;
use super::data::hinted_correlation;
use super::data::log_returns_series;
use super::data::quad_form;
use super::types::Asset;
use super::types::FundamentalStrength;
use crate::error::PortfolioError;
use crate::error::Result;

/// Minimum number of assets a risk model accepts.
pub const MIN_ASSETS: usize = 2;

/// Risk model construction settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskModelConfig {
  /// Range of pairwise correlation assumed when nothing better is known.
  /// The midpoint is used.
  pub correlation_band: (f64, f64),
  /// Upper sanity bound on annualized volatility.
  pub max_volatility: f64,
  /// Observations every asset needs before empirical correlation is used.
  pub min_history: usize,
  /// Floor for clipped eigenvalues during PSD repair.
  pub psd_epsilon: f64,
}

impl Default for RiskModelConfig {
  fn default() -> Self {
    Self {
      correlation_band: (0.6, 0.8),
      max_volatility: 2.0,
      min_history: 20,
      psd_epsilon: 1e-10,
    }
  }
}

impl RiskModelConfig {
  /// Midpoint of the correlation band.
  pub fn default_correlation(&self) -> f64 {
    0.5 * (self.correlation_band.0 + self.correlation_band.1)
  }

  fn validate(&self) -> Result<()> {
    let (lo, hi) = self.correlation_band;
    if !(-1.0..=1.0).contains(&lo) || !(-1.0..=1.0).contains(&hi) || lo > hi {
      return Err(PortfolioError::invalid(
        "config.correlation_band",
        format!("band ({lo}, {hi}) must be ordered and within [-1, 1]"),
      ));
    }
    if !(self.max_volatility.is_finite() && self.max_volatility > 0.0) {
      return Err(PortfolioError::invalid(
        "config.max_volatility",
        "must be a positive finite number",
      ));
    }
    Ok(())
  }
}

/// Where the correlation structure of a [`RiskModel`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationSource {
  /// Pearson correlation of aligned return histories.
  Empirical,
  /// Pairwise averages of per-asset correlation hints.
  Hints,
  /// Midpoint of the configured correlation band.
  DefaultBand,
  /// Implied by a caller-supplied covariance matrix.
  Supplied,
}

/// Immutable risk snapshot shared by every strategy of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskModel {
  assets: Vec<Asset>,
  tickers: Vec<String>,
  expected_returns: Vec<f64>,
  volatilities: Vec<f64>,
  covariance: Vec<Vec<f64>>,
  correlation: Vec<Vec<f64>>,
  source: CorrelationSource,
  repaired: bool,
}

impl RiskModel {
  /// Build the model from asset inputs, deriving correlation and covariance.
  pub fn build(assets: &[Asset], config: &RiskModelConfig) -> Result<Self> {
    config.validate()?;
    validate_assets(assets, config)?;

    let n = assets.len();
    let fallback = config.default_correlation();
    let (raw_corr, source) = match empirical_histories(assets, config.min_history) {
      Some(histories) => (
        correlation_matrix(&align_return_series(&histories)),
        CorrelationSource::Empirical,
      ),
      None if assets.iter().any(|a| a.correlation_hint.is_some()) => {
        let hints: Vec<Option<f64>> = assets.iter().map(|a| a.correlation_hint).collect();
        (hinted_correlation(&hints, fallback), CorrelationSource::Hints)
      }
      None => (constant_correlation(n, fallback), CorrelationSource::DefaultBand),
    };

    let (correlation, repaired) = ensure_psd(raw_corr, config.psd_epsilon);
    let volatilities: Vec<f64> = assets.iter().map(|a| a.volatility).collect();
    let covariance = covariance_matrix(&volatilities, &correlation);

    debug!(n, ?source, repaired, "built risk model");

    Ok(Self {
      tickers: assets.iter().map(|a| a.ticker.clone()).collect(),
      expected_returns: assets.iter().map(|a| a.expected_return).collect(),
      volatilities,
      covariance,
      correlation,
      source,
      repaired,
      assets: assets.to_vec(),
    })
  }

  /// Build the model around a precomputed annualized covariance matrix.
  ///
  /// Volatilities are taken from the matrix diagonal.
  pub fn from_covariance(
    assets: &[Asset],
    covariance: Vec<Vec<f64>>,
    config: &RiskModelConfig,
  ) -> Result<Self> {
    config.validate()?;
    validate_assets(assets, config)?;
    let covariance = validate_covariance(covariance, assets.len(), config)?;

    let (covariance, repaired) = ensure_psd(covariance, config.psd_epsilon);
    let volatilities: Vec<f64> = (0..assets.len())
      .map(|i| covariance[i][i].max(0.0).sqrt())
      .collect();
    let correlation = corr_from_cov(&covariance);

    debug!(n = assets.len(), repaired, "built risk model from supplied covariance");

    Ok(Self {
      tickers: assets.iter().map(|a| a.ticker.clone()).collect(),
      expected_returns: assets.iter().map(|a| a.expected_return).collect(),
      volatilities,
      covariance,
      correlation,
      source: CorrelationSource::Supplied,
      repaired,
      assets: assets.to_vec(),
    })
  }

  pub fn len(&self) -> usize {
    self.assets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.assets.is_empty()
  }

  pub fn assets(&self) -> &[Asset] {
    &self.assets
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  pub fn expected_returns(&self) -> &[f64] {
    &self.expected_returns
  }

  pub fn volatilities(&self) -> &[f64] {
    &self.volatilities
  }

  pub fn covariance(&self) -> &[Vec<f64>] {
    &self.covariance
  }

  pub fn correlation(&self) -> &[Vec<f64>] {
    &self.correlation
  }

  pub fn correlation_source(&self) -> CorrelationSource {
    self.source
  }

  /// Whether PSD repair altered the correlation or covariance input.
  pub fn was_repaired(&self) -> bool {
    self.repaired
  }

  /// `mu - r_f` per asset.
  pub fn excess_returns(&self, risk_free: f64) -> Vec<f64> {
    self.expected_returns.iter().map(|m| m - risk_free).collect()
  }

  pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
    quad_form(&self.covariance, weights)
  }

  pub fn portfolio_volatility(&self, weights: &[f64]) -> f64 {
    self.portfolio_variance(weights).sqrt()
  }
}

fn check_score(value: f64, field: String) -> Result<()> {
  if !(value.is_finite() && (0.0..=10.0).contains(&value)) {
    return Err(PortfolioError::invalid(
      field,
      format!("score {value} outside [0, 10]"),
    ));
  }
  Ok(())
}

fn validate_assets(assets: &[Asset], config: &RiskModelConfig) -> Result<()> {
  if assets.len() < MIN_ASSETS {
    return Err(PortfolioError::InsufficientData {
      required: MIN_ASSETS,
      actual: assets.len(),
    });
  }

  let mut seen = HashSet::with_capacity(assets.len());
  for (i, a) in assets.iter().enumerate() {
    let field = |name: &str| format!("assets[{i}].{name}");

    if a.ticker.trim().is_empty() {
      return Err(PortfolioError::invalid(field("ticker"), "ticker is empty"));
    }
    if !seen.insert(a.ticker.as_str()) {
      return Err(PortfolioError::invalid(
        field("ticker"),
        format!("duplicate ticker {}", a.ticker),
      ));
    }
    if !a.expected_return.is_finite() {
      return Err(PortfolioError::invalid(
        field("expected_return"),
        "expected return is not finite",
      ));
    }
    if !(a.volatility.is_finite() && a.volatility >= 0.0) {
      return Err(PortfolioError::invalid(
        field("volatility"),
        format!("volatility {} must be finite and non-negative", a.volatility),
      ));
    }
    if a.volatility > config.max_volatility {
      return Err(PortfolioError::invalid(
        field("volatility"),
        format!(
          "{} volatility {:.0}% exceeds the {:.0}% sanity bound",
          a.ticker,
          a.volatility * 100.0,
          config.max_volatility * 100.0
        ),
      ));
    }
    if !(a.price.is_finite() && a.price > 0.0) {
      return Err(PortfolioError::invalid(
        field("price"),
        format!("price {} must be positive", a.price),
      ));
    }
    check_score(a.technical_score, field("technical_score"))?;
    check_score(a.sentiment_score, field("sentiment_score"))?;
    if let FundamentalStrength::Score(s) = a.fundamental_strength {
      check_score(s, field("fundamental_strength"))?;
    }
    if let Some(rho) = a.correlation_hint {
      if !(rho.is_finite() && (-1.0..=1.0).contains(&rho)) {
        return Err(PortfolioError::invalid(
          field("correlation_hint"),
          format!("correlation {rho} outside [-1, 1]"),
        ));
      }
    }
    if let Some(mdd) = a.max_drawdown {
      if !(mdd.is_finite() && (0.0..=1.0).contains(&mdd)) {
        return Err(PortfolioError::invalid(
          field("max_drawdown"),
          format!("drawdown {mdd} outside [0, 1]"),
        ));
      }
    }
    if let Some(returns) = &a.returns {
      if returns.iter().any(|r| !r.is_finite()) {
        return Err(PortfolioError::invalid(
          field("returns"),
          "return history contains non-finite values",
        ));
      }
    }
  }

  Ok(())
}

fn validate_covariance(
  mut cov: Vec<Vec<f64>>,
  n: usize,
  config: &RiskModelConfig,
) -> Result<Vec<Vec<f64>>> {
  if cov.len() != n || cov.iter().any(|row| row.len() != n) {
    return Err(PortfolioError::invalid(
      "covariance",
      format!("expected a {n}x{n} matrix"),
    ));
  }

  for i in 0..n {
    let var = cov[i][i];
    if !(var.is_finite() && var >= 0.0) {
      return Err(PortfolioError::invalid(
        format!("covariance[{i}][{i}]"),
        format!("variance {var} must be finite and non-negative"),
      ));
    }
    if var.sqrt() > config.max_volatility {
      return Err(PortfolioError::invalid(
        format!("covariance[{i}][{i}]"),
        format!(
          "implied volatility {:.0}% exceeds the {:.0}% sanity bound",
          var.sqrt() * 100.0,
          config.max_volatility * 100.0
        ),
      ));
    }
    for j in (i + 1)..n {
      let (a, b) = (cov[i][j], cov[j][i]);
      if !(a.is_finite() && b.is_finite()) {
        return Err(PortfolioError::invalid(
          format!("covariance[{i}][{j}]"),
          "covariance entry is not finite",
        ));
      }
      if (a - b).abs() > 1e-10 * a.abs().max(b.abs()).max(1.0) {
        return Err(PortfolioError::invalid(
          format!("covariance[{i}][{j}]"),
          format!("matrix is not symmetric ({a} vs {b})"),
        ));
      }
      let mid = 0.5 * (a + b);
      cov[i][j] = mid;
      cov[j][i] = mid;
    }
  }

  Ok(cov)
}

/// Return histories when every asset supplies at least `min_len` observations.
fn empirical_histories(assets: &[Asset], min_len: usize) -> Option<Vec<Vec<f64>>> {
  let histories: Vec<Vec<f64>> = assets
    .iter()
    .map(|a| match (&a.returns, &a.price_history) {
      (Some(r), _) => Some(r.clone()),
      (None, Some(closes)) => Some(log_returns_series(closes)),
      (None, None) => None,
    })
    .collect::<Option<_>>()?;

  if histories.iter().all(|h| h.len() >= min_len.max(2)) {
    Some(histories)
  } else {
    debug!(min_len, "return history too short, ignoring it");
    None
  }
}

fn to_dmatrix(mat: &[Vec<f64>]) -> DMatrix<f64> {
  let n = mat.len();
  DMatrix::from_fn(n, n, |i, j| 0.5 * (mat[i][j] + mat[j][i]))
}

fn from_dmatrix(mat: &DMatrix<f64>) -> Vec<Vec<f64>> {
  (0..mat.nrows())
    .map(|i| (0..mat.ncols()).map(|j| mat[(i, j)]).collect())
    .collect()
}

/// Largest eigenvalue of a symmetric matrix.
pub(crate) fn largest_eigenvalue(mat: &[Vec<f64>]) -> f64 {
  if mat.is_empty() {
    return 0.0;
  }
  to_dmatrix(mat).symmetric_eigen().eigenvalues.max()
}

/// Whether a symmetric matrix is positive semi-definite up to round-off.
pub fn is_psd(mat: &[Vec<f64>]) -> bool {
  if mat.is_empty() {
    return true;
  }
  let eig = to_dmatrix(mat).symmetric_eigen();
  let scale = eig.eigenvalues.iter().fold(1.0_f64, |m, l| m.max(l.abs()));
  eig.eigenvalues.iter().all(|&l| l >= -1e-12 * scale)
}

/// Clip negative eigenvalues to `epsilon`, rebuild, and rescale so the
/// diagonal matches the input. Falls back to shrinking the off-diagonal part
/// toward zero if round-off still leaves a negative eigenvalue.
pub fn repair_psd(mat: &[Vec<f64>], epsilon: f64) -> Vec<Vec<f64>> {
  let n = mat.len();
  let eig = to_dmatrix(mat).symmetric_eigen();
  let clipped = eig.eigenvalues.map(|l| l.max(epsilon));
  let rebuilt =
    &eig.eigenvectors * DMatrix::from_diagonal(&clipped) * eig.eigenvectors.transpose();

  let scale: Vec<f64> = (0..n)
    .map(|i| {
      let target = mat[i][i].max(0.0);
      let current = rebuilt[(i, i)];
      if current > 0.0 {
        (target / current).sqrt()
      } else {
        0.0
      }
    })
    .collect();

  let mut out = from_dmatrix(&rebuilt);
  for i in 0..n {
    for j in 0..n {
      out[i][j] *= scale[i] * scale[j];
    }
    out[i][i] = mat[i][i].max(0.0);
  }

  if is_psd(&out) {
    out
  } else {
    shrink_toward_diagonal(&out)
  }
}

fn shrink_toward_diagonal(mat: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = mat.len();
  let shrink = |keep: f64| -> Vec<Vec<f64>> {
    (0..n)
      .map(|i| {
        (0..n)
          .map(|j| if i == j { mat[i][j] } else { keep * mat[i][j] })
          .collect()
      })
      .collect()
  };

  for step in 1..10 {
    let shrunk = shrink(1.0 - step as f64 / 10.0);
    if is_psd(&shrunk) {
      return shrunk;
    }
  }
  shrink(0.0)
}

fn ensure_psd(mat: Vec<Vec<f64>>, epsilon: f64) -> (Vec<Vec<f64>>, bool) {
  if is_psd(&mat) {
    (mat, false)
  } else {
    warn!("matrix is not positive semi-definite, repairing");
    (repair_psd(&mat, epsilon), true)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::types::StrengthLabel;

  fn sample_assets() -> Vec<Asset> {
    vec![
      Asset::new("NVDA", 0.15, 0.207, 120.0),
      Asset::new("AAPL", 0.12, 0.25, 190.0),
    ]
  }

  #[test]
  fn default_band_midpoint_drives_covariance() {
    let model = RiskModel::build(&sample_assets(), &RiskModelConfig::default()).unwrap();

    assert_eq!(model.correlation_source(), CorrelationSource::DefaultBand);
    assert!(!model.was_repaired());
    assert_abs_diff_eq!(model.correlation()[0][1], 0.7, epsilon = 1e-12);
    assert_abs_diff_eq!(model.covariance()[0][0], 0.207 * 0.207, epsilon = 1e-15);
    assert_abs_diff_eq!(
      model.covariance()[0][1],
      0.7 * 0.207 * 0.25,
      epsilon = 1e-15
    );
  }

  #[test]
  fn rejects_single_asset() {
    let err = RiskModel::build(&sample_assets()[..1], &RiskModelConfig::default()).unwrap_err();
    assert_eq!(
      err,
      PortfolioError::InsufficientData {
        required: 2,
        actual: 1
      }
    );
  }

  #[test]
  fn rejects_out_of_range_inputs() {
    let config = RiskModelConfig::default();
    let mut bad_vol = sample_assets();
    bad_vol[0].volatility = -0.1;
    let mut bad_price = sample_assets();
    bad_price[1].price = 0.0;
    let mut bad_score = sample_assets();
    bad_score[1].sentiment_score = 11.0;
    let mut dup = sample_assets();
    dup[1].ticker = "NVDA".into();
    let mut bad_fund = sample_assets();
    bad_fund[0].fundamental_strength = FundamentalStrength::Score(-1.0);

    for assets in [bad_vol, bad_price, bad_score, dup, bad_fund] {
      assert!(matches!(
        RiskModel::build(&assets, &config),
        Err(PortfolioError::InvalidInput { .. })
      ));
    }
  }

  #[test]
  fn implausible_volatility_is_rejected() {
    let mut assets = sample_assets();
    assets[0].volatility = 81.0;

    let err = RiskModel::build(&assets, &RiskModelConfig::default()).unwrap_err();
    match err {
      PortfolioError::InvalidInput { field, reason } => {
        assert_eq!(field, "assets[0].volatility");
        assert!(reason.contains("8100%"), "{reason}");
      }
      other => panic!("unexpected error {other:?}"),
    }
  }

  #[test]
  fn long_histories_switch_to_empirical_correlation() {
    let base: Vec<f64> = (0..40).map(|t| ((t as f64) * 0.7).sin() * 0.01).collect();
    let follower: Vec<f64> = base.iter().map(|r| 0.8 * r + 0.0005).collect();
    let assets = vec![
      Asset::new("AAA", 0.1, 0.2, 10.0).with_returns(base),
      Asset::new("BBB", 0.1, 0.3, 10.0).with_returns(follower),
    ];

    let model = RiskModel::build(&assets, &RiskModelConfig::default()).unwrap();
    assert_eq!(model.correlation_source(), CorrelationSource::Empirical);
    assert_abs_diff_eq!(model.correlation()[0][1], 1.0, epsilon = 1e-9);
  }

  #[test]
  fn price_history_counts_as_history() {
    let closes_a: Vec<f64> = (0..30).map(|t| 100.0 + (t as f64).sin()).collect();
    let closes_b: Vec<f64> = (0..30).map(|t| 50.0 + (t as f64).cos()).collect();
    let assets = vec![
      Asset::new("AAA", 0.1, 0.2, 100.0).with_price_history(closes_a),
      Asset::new("BBB", 0.1, 0.3, 50.0).with_price_history(closes_b),
    ];

    let model = RiskModel::build(&assets, &RiskModelConfig::default()).unwrap();
    assert_eq!(model.correlation_source(), CorrelationSource::Empirical);
  }

  #[test]
  fn short_histories_fall_back_to_hints() {
    let assets = vec![
      Asset::new("AAA", 0.1, 0.2, 10.0)
        .with_returns(vec![0.01, 0.02])
        .with_correlation_hint(0.4),
      Asset::new("BBB", 0.1, 0.3, 10.0).with_correlation_hint(0.6),
    ];

    let model = RiskModel::build(&assets, &RiskModelConfig::default()).unwrap();
    assert_eq!(model.correlation_source(), CorrelationSource::Hints);
    assert_abs_diff_eq!(model.correlation()[0][1], 0.5, epsilon = 1e-12);
  }

  #[test]
  fn inconsistent_hints_are_repaired_to_psd() {
    let assets = vec![
      Asset::new("AAA", 0.1, 0.2, 10.0).with_correlation_hint(-0.9),
      Asset::new("BBB", 0.1, 0.3, 10.0).with_correlation_hint(-0.9),
      Asset::new("CCC", 0.1, 0.25, 10.0).with_correlation_hint(-0.9),
    ];

    let model = RiskModel::build(&assets, &RiskModelConfig::default()).unwrap();
    assert!(model.was_repaired());
    assert!(is_psd(model.covariance()));
    for i in 0..3 {
      assert_abs_diff_eq!(model.correlation()[i][i], 1.0, epsilon = 1e-12);
      assert_abs_diff_eq!(
        model.covariance()[i][i],
        model.volatilities()[i].powi(2),
        epsilon = 1e-12
      );
    }
  }

  #[test]
  fn repair_keeps_diagonal_and_symmetry() {
    let bad = vec![
      vec![1.0, 0.9, -0.9],
      vec![0.9, 1.0, 0.9],
      vec![-0.9, 0.9, 1.0],
    ];
    assert!(!is_psd(&bad));

    let fixed = repair_psd(&bad, 1e-10);
    assert!(is_psd(&fixed));
    for i in 0..3 {
      assert_abs_diff_eq!(fixed[i][i], 1.0, epsilon = 1e-12);
      for j in 0..3 {
        assert_abs_diff_eq!(fixed[i][j], fixed[j][i], epsilon = 1e-12);
      }
    }
  }

  #[test]
  fn supplied_covariance_is_validated() {
    let config = RiskModelConfig::default();
    let assets = sample_assets();

    let asym = vec![vec![0.04, 0.01], vec![0.02, 0.0625]];
    assert!(RiskModel::from_covariance(&assets, asym, &config).is_err());

    let wrong_shape = vec![vec![0.04, 0.01]];
    assert!(RiskModel::from_covariance(&assets, wrong_shape, &config).is_err());

    let cov = vec![vec![0.04, 0.01], vec![0.01, 0.0625]];
    let model = RiskModel::from_covariance(&assets, cov, &config).unwrap();
    assert_eq!(model.correlation_source(), CorrelationSource::Supplied);
    assert_abs_diff_eq!(model.volatilities()[0], 0.2, epsilon = 1e-12);
    assert_abs_diff_eq!(model.correlation()[0][1], 0.01 / (0.2 * 0.25), epsilon = 1e-12);
  }

  #[test]
  fn labels_are_accepted_without_range_checks() {
    let mut assets = sample_assets();
    assets[0].fundamental_strength = FundamentalStrength::Label(StrengthLabel::High);
    assert!(RiskModel::build(&assets, &RiskModelConfig::default()).is_ok());
  }
}
