//! # Portfolio Types
//!
//! $$
//! \mathbf{w} \in \Delta^{N-1} = \{\mathbf{w} \ge 0,\ \mathbf{1}^\top \mathbf{w} = 1\}
//! $$
//!
//! Asset inputs, the closed strategy set and the immutable result records of a run.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use super::metrics::MetricsConfig;
use super::metrics::PortfolioMetrics;
use super::metrics::evaluate;
use super::risk_model::RiskModel;
use crate::error::PortfolioError;
use crate::error::Result;

/// Absolute tolerance on `sum(w) - 1` accepted before renormalization.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Discrete fundamental-strength label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrengthLabel {
  Low,
  Med,
  High,
}

/// Fundamental strength, either as a label or a numeric score on `[0, 10]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FundamentalStrength {
  Label(StrengthLabel),
  Score(f64),
}

impl Default for FundamentalStrength {
  fn default() -> Self {
    Self::Label(StrengthLabel::Med)
  }
}

impl fmt::Display for FundamentalStrength {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Label(StrengthLabel::Low) => write!(f, "LOW"),
      Self::Label(StrengthLabel::Med) => write!(f, "MED"),
      Self::Label(StrengthLabel::High) => write!(f, "HIGH"),
      Self::Score(s) => write!(f, "{s:.1}"),
    }
  }
}

fn neutral_score() -> f64 {
  5.0
}

/// Per-asset inputs supplied by the upstream technical, fundamental and
/// sentiment collaborators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
  /// Asset identifier.
  pub ticker: String,
  /// Expected annual return, may be negative.
  pub expected_return: f64,
  /// Annualized volatility.
  pub volatility: f64,
  /// Current price.
  pub price: f64,
  /// Technical score on `[0, 10]`.
  #[serde(default = "neutral_score")]
  pub technical_score: f64,
  /// Sentiment score on `[0, 10]`.
  #[serde(default = "neutral_score")]
  pub sentiment_score: f64,
  /// Fundamental strength.
  #[serde(default)]
  pub fundamental_strength: FundamentalStrength,
  /// Correlation of this asset with its peers, when no history is available.
  #[serde(default)]
  pub correlation_hint: Option<f64>,
  /// Periodic return history used for empirical correlation.
  #[serde(default)]
  pub returns: Option<Vec<f64>>,
  /// Close prices, converted to log returns when `returns` is absent.
  #[serde(default)]
  pub price_history: Option<Vec<f64>>,
  /// Externally estimated max drawdown on `[0, 1]`.
  #[serde(default)]
  pub max_drawdown: Option<f64>,
}

impl Asset {
  /// Asset with neutral qualitative scores and no optional inputs.
  pub fn new(ticker: impl Into<String>, expected_return: f64, volatility: f64, price: f64) -> Self {
    Self {
      ticker: ticker.into(),
      expected_return,
      volatility,
      price,
      technical_score: neutral_score(),
      sentiment_score: neutral_score(),
      fundamental_strength: FundamentalStrength::default(),
      correlation_hint: None,
      returns: None,
      price_history: None,
      max_drawdown: None,
    }
  }

  pub fn with_technical(mut self, score: f64) -> Self {
    self.technical_score = score;
    self
  }

  pub fn with_sentiment(mut self, score: f64) -> Self {
    self.sentiment_score = score;
    self
  }

  pub fn with_fundamental(mut self, strength: FundamentalStrength) -> Self {
    self.fundamental_strength = strength;
    self
  }

  pub fn with_correlation_hint(mut self, rho: f64) -> Self {
    self.correlation_hint = Some(rho);
    self
  }

  pub fn with_returns(mut self, returns: Vec<f64>) -> Self {
    self.returns = Some(returns);
    self
  }

  pub fn with_price_history(mut self, closes: Vec<f64>) -> Self {
    self.price_history = Some(closes);
    self
  }

  pub fn with_max_drawdown(mut self, mdd: f64) -> Self {
    self.max_drawdown = Some(mdd);
    self
  }
}

/// The closed set of allocation strategies, in fallback priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyKind {
  /// Tangency portfolio of the long-only frontier.
  MaxSharpe,
  /// Global minimum-variance portfolio.
  MinVariance,
  /// Equal risk contributions.
  RiskParity,
  /// Maximum diversification ratio.
  MaxDiversification,
  /// Hierarchical Risk Parity (Lopez de Prado).
  HierarchicalRiskParity,
}

impl StrategyKind {
  /// All strategies in priority order.
  pub const ALL: [StrategyKind; 5] = [
    StrategyKind::MaxSharpe,
    StrategyKind::MinVariance,
    StrategyKind::RiskParity,
    StrategyKind::MaxDiversification,
    StrategyKind::HierarchicalRiskParity,
  ];

  /// Human-readable strategy name.
  pub fn name(self) -> &'static str {
    match self {
      Self::MaxSharpe => "Maximum Sharpe",
      Self::MinVariance => "Minimum Variance",
      Self::RiskParity => "Risk Parity",
      Self::MaxDiversification => "Maximum Diversification",
      Self::HierarchicalRiskParity => "Hierarchical Risk Parity",
    }
  }

  /// Investment philosophy label.
  pub fn philosophy(self) -> &'static str {
    match self {
      Self::MaxSharpe => "Best risk-adjusted return",
      Self::MinVariance => "Lowest portfolio volatility",
      Self::RiskParity => "Equal risk contribution",
      Self::MaxDiversification => "Maximum diversification benefit",
      Self::HierarchicalRiskParity => "Cluster-aware risk budgeting",
    }
  }

  /// Position in the fallback priority order, lower first.
  pub fn priority(self) -> usize {
    Self::ALL.iter().position(|&k| k == self).unwrap_or(Self::ALL.len())
  }
}

impl fmt::Display for StrategyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for StrategyKind {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "max-sharpe" | "maxsharpe" | "sharpe" | "tangency" => Ok(Self::MaxSharpe),
      "min-variance" | "minvariance" | "min-var" | "gmv" => Ok(Self::MinVariance),
      "risk-parity" | "riskparity" | "erc" => Ok(Self::RiskParity),
      "max-diversification" | "maxdiversification" | "mdp" => Ok(Self::MaxDiversification),
      "hrp" | "hierarchical-risk-parity" => Ok(Self::HierarchicalRiskParity),
      other => Err(PortfolioError::invalid(
        "strategy",
        format!("unknown strategy '{other}'"),
      )),
    }
  }
}

/// Long-only, fully invested weight vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct WeightVector(Vec<f64>);

impl WeightVector {
  /// Validate weights that should already sum to one.
  ///
  /// A sum within [`WEIGHT_TOLERANCE`] of one is renormalized; anything else
  /// is rejected.
  pub fn new(weights: Vec<f64>) -> Result<Self> {
    let weights = check_entries(weights)?;
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
      return Err(PortfolioError::invalid(
        "weights",
        format!("weights sum to {sum:.8}, expected 1"),
      ));
    }
    Ok(Self(weights.into_iter().map(|w| w / sum).collect()))
  }

  /// Normalize non-negative raw scores into a weight vector.
  pub fn from_raw(raw: Vec<f64>) -> Result<Self> {
    let raw = check_entries(raw)?;
    let sum: f64 = raw.iter().sum();
    if sum <= 1e-300 {
      return Err(PortfolioError::invalid("weights", "raw weights sum to zero"));
    }
    Ok(Self(raw.into_iter().map(|w| w / sum).collect()))
  }

  /// `1/N` allocation.
  pub fn equal(n: usize) -> Result<Self> {
    Self::from_raw(vec![1.0; n])
  }

  pub fn as_slice(&self) -> &[f64] {
    &self.0
  }

  pub fn into_inner(self) -> Vec<f64> {
    self.0
  }
}

fn check_entries(mut weights: Vec<f64>) -> Result<Vec<f64>> {
  if weights.is_empty() {
    return Err(PortfolioError::invalid("weights", "empty weight vector"));
  }
  for (i, w) in weights.iter_mut().enumerate() {
    if !w.is_finite() {
      return Err(PortfolioError::invalid(
        format!("weights[{i}]"),
        "weight is not finite",
      ));
    }
    // solver round-off
    if *w < 0.0 && *w > -WEIGHT_TOLERANCE {
      *w = 0.0;
    }
    if *w < 0.0 {
      return Err(PortfolioError::invalid(
        format!("weights[{i}]"),
        format!("negative weight {w}"),
      ));
    }
  }
  Ok(weights)
}

impl Deref for WeightVector {
  type Target = [f64];

  fn deref(&self) -> &[f64] {
    &self.0
  }
}

impl TryFrom<Vec<f64>> for WeightVector {
  type Error = PortfolioError;

  fn try_from(value: Vec<f64>) -> Result<Self> {
    Self::new(value)
  }
}

impl From<WeightVector> for Vec<f64> {
  fn from(value: WeightVector) -> Self {
    value.0
  }
}

/// How a strategy's weights were obtained.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SolveStatus {
  /// The strategy's own solver produced the weights.
  Optimal,
  /// A documented fallback produced the weights.
  Degraded { reason: String },
}

/// Output of one strategy for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
  pub strategy: StrategyKind,
  pub philosophy: String,
  pub tickers: Vec<String>,
  pub weights: WeightVector,
  pub metrics: PortfolioMetrics,
  pub status: SolveStatus,
}

impl StrategyResult {
  /// Evaluate `weights` against `model` and wrap them as a result record.
  pub fn evaluate(
    strategy: StrategyKind,
    weights: WeightVector,
    status: SolveStatus,
    model: &RiskModel,
    config: &MetricsConfig,
  ) -> Result<Self> {
    let metrics = evaluate(&weights, model, config)?;
    Ok(Self {
      strategy,
      philosophy: strategy.philosophy().to_string(),
      tickers: model.tickers().to_vec(),
      weights,
      metrics,
      status,
    })
  }

  pub fn name(&self) -> &'static str {
    self.strategy.name()
  }

  pub fn expected_return(&self) -> f64 {
    self.metrics.expected_return
  }

  pub fn volatility(&self) -> f64 {
    self.metrics.volatility
  }

  pub fn sharpe(&self) -> Option<f64> {
    self.metrics.sharpe
  }

  pub fn is_degraded(&self) -> bool {
    matches!(self.status, SolveStatus::Degraded { .. })
  }

  /// Weight held in `ticker`.
  pub fn weight_of(&self, ticker: &str) -> Option<f64> {
    weight_of(&self.tickers, &self.weights, ticker)
  }

  /// Weights keyed by ticker.
  pub fn weights_by_ticker(&self) -> BTreeMap<String, f64> {
    keyed(&self.tickers, &self.weights)
  }
}

/// A strategy that produced no result in a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyFailure {
  pub strategy: StrategyKind,
  pub reason: String,
}

/// Results of the strategy suite: completed strategies in priority order plus
/// failure records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteOutcome {
  pub results: Vec<StrategyResult>,
  pub failures: Vec<StrategyFailure>,
}

impl SuiteOutcome {
  pub fn get(&self, strategy: StrategyKind) -> Option<&StrategyResult> {
    self.results.iter().find(|r| r.strategy == strategy)
  }
}

/// Holding period suggested by the balance of technical and fundamental signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeHorizon {
  ShortTerm,
  MediumTerm,
  LongTerm,
}

impl TimeHorizon {
  pub fn label(self) -> &'static str {
    match self {
      Self::ShortTerm => "Short-term (1-3 months)",
      Self::MediumTerm => "Medium-term (6-12 months)",
      Self::LongTerm => "Long-term (12+ months)",
    }
  }
}

impl fmt::Display for TimeHorizon {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

/// Final weights: one base strategy plus a bounded qualitative tilt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalAllocation {
  pub base_strategy: StrategyKind,
  pub tickers: Vec<String>,
  pub base_weights: WeightVector,
  pub weights: WeightVector,
  /// Zero-sum qualitative tilt scores.
  pub tilt: Vec<f64>,
  /// Per-asset shift applied before renormalization, `|shift_i| <= k`.
  pub applied_shift: Vec<f64>,
  /// Confidence on `[0, 10]`.
  pub confidence: f64,
  pub time_horizon: TimeHorizon,
  pub metrics: PortfolioMetrics,
  pub rationale: String,
}

impl FinalAllocation {
  pub fn weight_of(&self, ticker: &str) -> Option<f64> {
    weight_of(&self.tickers, &self.weights, ticker)
  }

  pub fn weights_by_ticker(&self) -> BTreeMap<String, f64> {
    keyed(&self.tickers, &self.weights)
  }
}

/// Everything one run produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
  pub strategies: Vec<StrategyResult>,
  pub failures: Vec<StrategyFailure>,
  pub final_allocation: FinalAllocation,
}

fn weight_of(tickers: &[String], weights: &[f64], ticker: &str) -> Option<f64> {
  tickers
    .iter()
    .position(|t| t == ticker)
    .and_then(|i| weights.get(i).copied())
}

fn keyed(tickers: &[String], weights: &[f64]) -> BTreeMap<String, f64> {
  tickers
    .iter()
    .cloned()
    .zip(weights.iter().copied())
    .collect()
}

/// Point in time after which iterative solvers abort.
#[derive(Clone, Copy, Debug, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
  /// No deadline.
  pub fn none() -> Self {
    Self(None)
  }

  pub fn after(timeout: Duration) -> Self {
    Self(Instant::now().checked_add(timeout))
  }

  pub fn at(instant: Instant) -> Self {
    Self(Some(instant))
  }

  pub fn expired(&self) -> bool {
    self.0.is_some_and(|t| Instant::now() >= t)
  }

  /// `Err(TimedOut)` once the deadline has passed.
  pub fn check(&self, strategy: StrategyKind) -> Result<()> {
    if self.expired() {
      Err(PortfolioError::TimedOut { strategy })
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn near_unit_sum_is_renormalized() {
    let w = WeightVector::new(vec![0.5, 0.5000004]).unwrap();
    let sum: f64 = w.iter().sum();
    assert!((sum - 1.0).abs() < 1e-12);
  }

  #[test]
  fn far_from_unit_sum_is_rejected() {
    assert!(WeightVector::new(vec![0.5, 0.4]).is_err());
    assert!(WeightVector::new(vec![1.2, -0.2]).is_err());
    assert!(WeightVector::new(vec![]).is_err());
  }

  #[test]
  fn raw_scores_normalize_and_clip_round_off() {
    let w = WeightVector::from_raw(vec![3.0, 1.0, -1e-12]).unwrap();
    assert_eq!(w.as_slice(), &[0.75, 0.25, 0.0]);
    assert!(WeightVector::from_raw(vec![0.0, 0.0]).is_err());
  }

  #[test]
  fn weight_vector_deserialization_validates() {
    let ok: WeightVector = serde_json::from_str("[0.25, 0.75]").unwrap();
    assert_eq!(ok.len(), 2);
    assert!(serde_json::from_str::<WeightVector>("[0.25, 0.25]").is_err());
  }

  #[test]
  fn strategy_names_parse_and_keep_priority() {
    assert_eq!(
      "hrp".parse::<StrategyKind>().unwrap(),
      StrategyKind::HierarchicalRiskParity
    );
    assert_eq!(
      "Max-Sharpe".parse::<StrategyKind>().unwrap(),
      StrategyKind::MaxSharpe
    );
    assert!("momentum".parse::<StrategyKind>().is_err());
    assert_eq!(StrategyKind::MaxSharpe.priority(), 0);
    assert_eq!(StrategyKind::HierarchicalRiskParity.priority(), 4);
  }

  #[test]
  fn asset_deserializes_labels_and_scores() {
    let json = r#"[
      {"ticker": "NVDA", "expectedReturn": 0.15, "volatility": 0.207, "price": 120.0,
       "sentimentScore": 7.0, "fundamentalStrength": "HIGH"},
      {"ticker": "AAPL", "expectedReturn": 0.12, "volatility": 0.25, "price": 190.0,
       "fundamentalStrength": 6.5, "correlationHint": 0.7}
    ]"#;
    let assets: Vec<Asset> = serde_json::from_str(json).unwrap();

    assert_eq!(
      assets[0].fundamental_strength,
      FundamentalStrength::Label(StrengthLabel::High)
    );
    assert_eq!(assets[1].fundamental_strength, FundamentalStrength::Score(6.5));
    assert_eq!(assets[1].technical_score, 5.0);
    assert_eq!(assets[1].correlation_hint, Some(0.7));
  }

  #[test]
  fn deadline_in_the_past_expires() {
    let past = Deadline::at(Instant::now());
    assert!(past.expired());
    assert_eq!(
      past.check(StrategyKind::RiskParity),
      Err(PortfolioError::TimedOut {
        strategy: StrategyKind::RiskParity
      })
    );
    assert!(Deadline::none().check(StrategyKind::RiskParity).is_ok());
  }
}
