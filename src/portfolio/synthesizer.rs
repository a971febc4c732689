//! # Decision Synthesizer
//!
//! $$
//! f_i = \frac{a\,F_i + b\,S_i}{10\,(a+b)},\qquad
//! t_i = f_i - \bar f,\qquad
//! w_i = \frac{\operatorname{clip}(w^{\text{base}}_i + k\,t_i,\ 0,\ 1)}
//!            {\sum_j \operatorname{clip}(w^{\text{base}}_j + k\,t_j,\ 0,\ 1)}
//! $$
//!
//! Blends one base strategy with a bounded, zero-sum qualitative tilt and
//! scores how much the run can be trusted.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::metrics::MetricsConfig;
use super::metrics::evaluate;
use super::risk_model::RiskModel;
use super::types::Asset;
use super::types::FinalAllocation;
use super::types::FundamentalStrength;
use super::types::SolveStatus;
use super::types::StrategyKind;
use super::types::StrategyResult;
use super::types::StrengthLabel;
use super::types::SuiteOutcome;
use super::types::TimeHorizon;
use super::types::WeightVector;
use crate::error::PortfolioError;
use crate::error::Result;

/// Coefficients of the qualitative tilt and the confidence score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiltConfig {
  /// Maximum per-asset shift `k` before renormalization.
  pub sensitivity: f64,
  /// Weight `a` of the fundamental score.
  pub fundamental_weight: f64,
  /// Weight `b` of the sentiment score.
  pub sentiment_weight: f64,
  /// Score of a `LOW` fundamental label.
  pub low_score: f64,
  /// Score of a `MED` fundamental label.
  pub med_score: f64,
  /// Score of a `HIGH` fundamental label.
  pub high_score: f64,
  /// Share of confidence driven by cross-strategy agreement.
  pub agreement_weight: f64,
  /// Share of confidence driven by signal strength.
  pub signal_weight: f64,
  /// Confidence points removed per degraded or failed strategy.
  pub degradation_penalty: f64,
  /// Score gap between technical and fundamental balance that moves the
  /// horizon away from medium term.
  pub horizon_margin: f64,
  /// Substitute the next successful strategy in priority order when the base
  /// strategy is unavailable.
  pub fallback_to_priority: bool,
}

impl Default for TiltConfig {
  fn default() -> Self {
    Self {
      sensitivity: 0.02,
      fundamental_weight: 0.6,
      sentiment_weight: 0.4,
      low_score: 2.5,
      med_score: 5.0,
      high_score: 8.0,
      agreement_weight: 0.6,
      signal_weight: 0.4,
      degradation_penalty: 0.5,
      horizon_margin: 1.0,
      fallback_to_priority: true,
    }
  }
}

impl TiltConfig {
  pub fn validate(&self) -> Result<()> {
    if !(0.0..=1.0).contains(&self.sensitivity) {
      return Err(PortfolioError::invalid(
        "tilt.sensitivity",
        format!("{} is outside [0, 1]", self.sensitivity),
      ));
    }
    let pairs = [
      ("tilt.fundamental_weight", self.fundamental_weight),
      ("tilt.sentiment_weight", self.sentiment_weight),
      ("tilt.agreement_weight", self.agreement_weight),
      ("tilt.signal_weight", self.signal_weight),
      ("tilt.degradation_penalty", self.degradation_penalty),
      ("tilt.horizon_margin", self.horizon_margin),
    ];
    for (field, value) in pairs {
      if !value.is_finite() || value < 0.0 {
        return Err(PortfolioError::invalid(field, "must be finite and non-negative"));
      }
    }
    for (field, value) in [
      ("tilt.low_score", self.low_score),
      ("tilt.med_score", self.med_score),
      ("tilt.high_score", self.high_score),
    ] {
      if !(0.0..=10.0).contains(&value) {
        return Err(PortfolioError::invalid(field, "must lie in [0, 10]"));
      }
    }
    if self.fundamental_weight + self.sentiment_weight <= 0.0 {
      return Err(PortfolioError::invalid(
        "tilt",
        "fundamental and sentiment weights are both zero",
      ));
    }
    if self.agreement_weight + self.signal_weight <= 0.0 {
      return Err(PortfolioError::invalid(
        "tilt",
        "agreement and signal weights are both zero",
      ));
    }
    Ok(())
  }

  /// Fundamental strength on `[0, 10]`.
  pub fn fundamental_score(&self, strength: FundamentalStrength) -> f64 {
    match strength {
      FundamentalStrength::Label(StrengthLabel::Low) => self.low_score,
      FundamentalStrength::Label(StrengthLabel::Med) => self.med_score,
      FundamentalStrength::Label(StrengthLabel::High) => self.high_score,
      FundamentalStrength::Score(s) => s,
    }
  }

  /// Blended qualitative signal `f_i` on `[0, 1]`.
  pub fn signal(&self, asset: &Asset) -> f64 {
    let a = self.fundamental_weight;
    let b = self.sentiment_weight;
    let fundamental = self.fundamental_score(asset.fundamental_strength);
    (a * fundamental + b * asset.sentiment_score) / (10.0 * (a + b))
  }
}

/// Zero-sum tilt scores `f_i - mean(f)`.
pub fn tilt_scores(assets: &[Asset], config: &TiltConfig) -> Vec<f64> {
  let signals: Vec<f64> = assets.iter().map(|a| config.signal(a)).collect();
  let mean = signals.iter().sum::<f64>() / signals.len().max(1) as f64;
  signals.iter().map(|f| f - mean).collect()
}

/// `clip(base + k * tilt, 0, 1)` renormalized, with the pre-normalization shift.
pub fn apply_tilt(base: &[f64], tilt: &[f64], sensitivity: f64) -> Result<(WeightVector, Vec<f64>)> {
  let shift: Vec<f64> = tilt.iter().map(|t| sensitivity * t).collect();
  let raw: Vec<f64> = base
    .iter()
    .zip(shift.iter())
    .map(|(w, s)| (w + s).clamp(0.0, 1.0))
    .collect();
  Ok((WeightVector::from_raw(raw)?, shift))
}

/// `1 - mean total-variation distance` of each strategy to their average.
///
/// Degraded results borrow another strategy's weights and are left out. A
/// single remaining strategy carries no agreement information and scores `0.5`.
pub fn strategy_agreement(results: &[StrategyResult]) -> f64 {
  let results: Vec<&StrategyResult> = results.iter().filter(|r| !r.is_degraded()).collect();
  if results.len() < 2 {
    return 0.5;
  }
  let n = results[0].weights.len();
  let m = results.len() as f64;
  let consensus: Vec<f64> = (0..n)
    .map(|i| results.iter().map(|r| r.weights[i]).sum::<f64>() / m)
    .collect();

  let mean_tv = results
    .iter()
    .map(|r| {
      0.5
        * r
          .weights
          .iter()
          .zip(consensus.iter())
          .map(|(w, c)| (w - c).abs())
          .sum::<f64>()
    })
    .sum::<f64>()
    / m;

  (1.0 - mean_tv).clamp(0.0, 1.0)
}

/// Mean distance of the blended signals from neutral, scaled to `[0, 1]`.
pub fn signal_strength(assets: &[Asset], config: &TiltConfig) -> f64 {
  if assets.is_empty() {
    return 0.0;
  }
  assets
    .iter()
    .map(|a| 2.0 * (config.signal(a) - 0.5).abs())
    .sum::<f64>()
    / assets.len() as f64
}

/// Horizon from the weighted technical versus fundamental balance.
pub fn time_horizon(assets: &[Asset], weights: &[f64], config: &TiltConfig) -> TimeHorizon {
  let technical: f64 = assets
    .iter()
    .zip(weights.iter())
    .map(|(a, w)| w * a.technical_score)
    .sum();
  let fundamental: f64 = assets
    .iter()
    .zip(weights.iter())
    .map(|(a, w)| w * config.fundamental_score(a.fundamental_strength))
    .sum();

  if technical - fundamental > config.horizon_margin {
    TimeHorizon::ShortTerm
  } else if fundamental - technical > config.horizon_margin {
    TimeHorizon::LongTerm
  } else {
    TimeHorizon::MediumTerm
  }
}

fn select_base<'a>(
  outcome: &'a SuiteOutcome,
  requested: StrategyKind,
  config: &TiltConfig,
) -> Result<(&'a StrategyResult, Option<String>)> {
  if let Some(result) = outcome.get(requested) {
    return Ok((result, None));
  }

  let why = outcome
    .failures
    .iter()
    .find(|f| f.strategy == requested)
    .map(|f| f.reason.clone())
    .unwrap_or_else(|| "it was not run".to_string());

  if !config.fallback_to_priority {
    return Err(PortfolioError::NoViableStrategy(format!(
      "base strategy {requested} is unavailable: {why}"
    )));
  }

  let substitute = StrategyKind::ALL
    .iter()
    .find_map(|&kind| outcome.get(kind))
    .ok_or_else(|| {
      PortfolioError::NoViableStrategy(format!(
        "base strategy {requested} is unavailable ({why}) and no other strategy completed"
      ))
    })?;

  warn!(
    requested = %requested,
    substitute = %substitute.strategy,
    "base strategy unavailable, substituting by priority"
  );
  Ok((
    substitute,
    Some(format!(
      "Requested base strategy {requested} was unavailable ({why}); substituted {} by priority order.",
      substitute.strategy
    )),
  ))
}

/// Final allocation from a suite outcome.
///
/// Fails with `NoViableStrategy` only when the base strategy is unavailable and
/// no substitute is allowed or available. Degraded and failed strategies lower
/// the confidence and are listed in the rationale.
pub fn synthesize(
  outcome: &SuiteOutcome,
  model: &RiskModel,
  base: StrategyKind,
  config: &TiltConfig,
  metrics_config: &MetricsConfig,
) -> Result<FinalAllocation> {
  config.validate()?;
  let (base_result, substitution) = select_base(outcome, base, config)?;

  if base_result.tickers != model.tickers() {
    return Err(PortfolioError::invalid(
      "outcome",
      format!(
        "{} tickers do not match the risk model",
        base_result.strategy
      ),
    ));
  }

  let assets = model.assets();
  let tilt = tilt_scores(assets, config);
  let (weights, applied_shift) = apply_tilt(&base_result.weights, &tilt, config.sensitivity)?;

  let agreement = strategy_agreement(&outcome.results);
  let strength = signal_strength(assets, config);
  let degraded = outcome.results.iter().filter(|r| r.is_degraded()).count();
  let penalty = config.degradation_penalty * (degraded + outcome.failures.len()) as f64;
  let raw = 10.0 * (config.agreement_weight * agreement + config.signal_weight * strength)
    / (config.agreement_weight + config.signal_weight);
  let confidence = (raw - penalty).clamp(0.0, 10.0);
  debug!(agreement, strength, penalty, confidence, "confidence scored");

  let horizon = time_horizon(assets, &weights, config);
  let metrics = evaluate(&weights, model, metrics_config)?;

  let mut lines = vec![format!(
    "Base strategy: {} ({}).",
    base_result.strategy, base_result.philosophy
  )];
  lines.extend(substitution);
  for result in &outcome.results {
    if let SolveStatus::Degraded { reason } = &result.status {
      lines.push(format!("{} is degraded: {reason}.", result.strategy));
    }
  }
  for failure in &outcome.failures {
    lines.push(format!("{} was skipped: {}.", failure.strategy, failure.reason));
  }
  let shifts: Vec<String> = model
    .tickers()
    .iter()
    .zip(applied_shift.iter())
    .map(|(t, s)| format!("{t} {:+.2}pp", s * 100.0))
    .collect();
  lines.push(format!(
    "Qualitative tilt (k = {:.3}): {}.",
    config.sensitivity,
    shifts.join(", ")
  ));
  lines.push(format!(
    "Confidence {confidence:.1}/10 from strategy agreement {agreement:.2} and signal strength {strength:.2}, less {penalty:.1} for degraded or missing strategies."
  ));
  lines.push(format!("Time horizon: {horizon}."));
  let rationale = lines.join("\n");

  Ok(FinalAllocation {
    base_strategy: base_result.strategy,
    tickers: model.tickers().to_vec(),
    base_weights: base_result.weights.clone(),
    weights,
    tilt,
    applied_shift,
    confidence,
    time_horizon: horizon,
    metrics,
    rationale,
  })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::optimizers::OptimizerConfig;
  use crate::portfolio::optimizers::optimize_with_method;
  use crate::portfolio::risk_model::RiskModelConfig;
  use crate::portfolio::types::Deadline;
  use crate::portfolio::types::StrategyFailure;

  fn sample_model() -> RiskModel {
    RiskModel::build(
      &[
        Asset::new("NVDA", 0.15, 0.207, 120.0)
          .with_technical(7.0)
          .with_sentiment(7.5)
          .with_fundamental(FundamentalStrength::Label(StrengthLabel::High)),
        Asset::new("AAPL", 0.12, 0.25, 190.0)
          .with_technical(5.0)
          .with_sentiment(5.0)
          .with_fundamental(FundamentalStrength::Label(StrengthLabel::Med)),
      ],
      &RiskModelConfig::default(),
    )
    .unwrap()
  }

  fn full_outcome(model: &RiskModel) -> SuiteOutcome {
    let results = StrategyKind::ALL
      .iter()
      .map(|&kind| {
        let (w, status) =
          optimize_with_method(kind, model, &OptimizerConfig::default(), &Deadline::none())
            .unwrap();
        StrategyResult::evaluate(kind, w, status, model, &MetricsConfig::default()).unwrap()
      })
      .collect();
    SuiteOutcome {
      results,
      failures: Vec::new(),
    }
  }

  fn run(outcome: &SuiteOutcome, model: &RiskModel, config: &TiltConfig) -> Result<FinalAllocation> {
    synthesize(
      outcome,
      model,
      StrategyKind::MaxSharpe,
      config,
      &MetricsConfig::default(),
    )
  }

  #[test]
  fn tilt_is_zero_sum_and_bounded() {
    let model = sample_model();
    let config = TiltConfig::default();
    let tilt = tilt_scores(model.assets(), &config);
    assert_abs_diff_eq!(tilt.iter().sum::<f64>(), 0.0, epsilon = 1e-15);

    let alloc = run(&full_outcome(&model), &model, &config).unwrap();
    assert_abs_diff_eq!(alloc.tilt.iter().sum::<f64>(), 0.0, epsilon = 1e-15);
    for s in &alloc.applied_shift {
      assert!(s.abs() <= config.sensitivity + 1e-15);
    }
    assert_abs_diff_eq!(alloc.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
  }

  #[test]
  fn tilt_moves_weight_toward_stronger_signals() {
    let model = sample_model();
    let config = TiltConfig::default();
    let weights = [0.5, 0.5];
    let (tilted, shift) = apply_tilt(&weights, &tilt_scores(model.assets(), &config), 0.02).unwrap();

    assert!(shift[0] > 0.0 && shift[1] < 0.0);
    assert!(tilted[0] > 0.5);
    assert!((tilted[0] - 0.5).abs() < 0.01, "shift stays under one point");
  }

  #[test]
  fn neutral_signals_leave_base_untouched() {
    let model = RiskModel::build(
      &[
        Asset::new("AAA", 0.10, 0.2, 1.0),
        Asset::new("BBB", 0.08, 0.3, 1.0),
      ],
      &RiskModelConfig::default(),
    )
    .unwrap();
    let alloc = run(&full_outcome(&model), &model, &TiltConfig::default()).unwrap();

    for (w, b) in alloc.weights.iter().zip(alloc.base_weights.iter()) {
      assert_abs_diff_eq!(w, b, epsilon = 1e-12);
    }
    assert!(alloc.applied_shift.iter().all(|&s| s == 0.0));
    assert_eq!(alloc.time_horizon, TimeHorizon::MediumTerm);
  }

  #[test]
  fn clipping_renormalizes_corner_portfolios() {
    let (w, shift) = apply_tilt(&[1.0, 0.0], &[-0.3, 0.3], 0.02).unwrap();
    assert_abs_diff_eq!(shift[0], -0.006, epsilon = 1e-15);
    assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(w[1], 0.006, epsilon = 1e-12);
  }

  #[test]
  fn missing_base_falls_back_by_priority() {
    let model = sample_model();
    let mut outcome = full_outcome(&model);
    outcome.results.retain(|r| r.strategy != StrategyKind::MaxSharpe);
    outcome.failures.push(StrategyFailure {
      strategy: StrategyKind::MaxSharpe,
      reason: "timed out".into(),
    });

    let alloc = run(&outcome, &model, &TiltConfig::default()).unwrap();
    assert_eq!(alloc.base_strategy, StrategyKind::MinVariance);
    assert!(alloc.rationale.contains("substituted Minimum Variance"));
    assert!(alloc.rationale.contains("Maximum Sharpe was skipped: timed out"));
  }

  #[test]
  fn missing_base_without_fallback_is_fatal() {
    let model = sample_model();
    let mut outcome = full_outcome(&model);
    outcome.results.retain(|r| r.strategy != StrategyKind::MaxSharpe);
    let config = TiltConfig {
      fallback_to_priority: false,
      ..Default::default()
    };

    assert!(matches!(
      run(&outcome, &model, &config),
      Err(PortfolioError::NoViableStrategy(_))
    ));
    assert!(matches!(
      run(&SuiteOutcome::default(), &model, &TiltConfig::default()),
      Err(PortfolioError::NoViableStrategy(_))
    ));
  }

  #[test]
  fn degraded_and_failed_strategies_cost_confidence() {
    let model = sample_model();
    let clean = run(&full_outcome(&model), &model, &TiltConfig::default()).unwrap();

    let mut outcome = full_outcome(&model);
    outcome.results[2].status = SolveStatus::Degraded {
      reason: "inverse-volatility fallback".into(),
    };
    outcome.failures.push(StrategyFailure {
      strategy: StrategyKind::HierarchicalRiskParity,
      reason: "timed out".into(),
    });
    outcome.results.pop();
    let degraded = run(&outcome, &model, &TiltConfig::default()).unwrap();

    assert!(degraded.confidence < clean.confidence);
    assert!((0.0..=10.0).contains(&clean.confidence));
    assert!(degraded.rationale.contains("Risk Parity is degraded"));
  }

  #[test]
  fn identical_strategies_agree_fully() {
    let model = sample_model();
    let mut outcome = full_outcome(&model);
    let first = outcome.results[0].weights.clone();
    for r in &mut outcome.results {
      r.weights = first.clone();
    }
    assert_abs_diff_eq!(strategy_agreement(&outcome.results), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(strategy_agreement(&outcome.results[..1]), 0.5);
  }

  #[test]
  fn degraded_results_do_not_count_towards_agreement() {
    let model = sample_model();
    let mut outcome = full_outcome(&model);

    // a max-Sharpe fallback carries the min-variance weights verbatim
    outcome.results[0].weights = outcome.results[1].weights.clone();
    outcome.results[0].status = SolveStatus::Degraded {
      reason: "no asset beats the risk-free rate; using minimum-variance weights".into(),
    };
    let without_base = strategy_agreement(&outcome.results[1..]);

    assert_abs_diff_eq!(strategy_agreement(&outcome.results), without_base, epsilon = 1e-12);
  }

  #[test]
  fn horizon_follows_signal_balance() {
    let config = TiltConfig::default();
    let momentum = [Asset::new("MOMO", 0.2, 0.4, 1.0)
      .with_technical(9.0)
      .with_fundamental(FundamentalStrength::Label(StrengthLabel::Low))];
    let value = [Asset::new("VAL", 0.08, 0.15, 1.0)
      .with_technical(3.0)
      .with_fundamental(FundamentalStrength::Score(9.0))];

    assert_eq!(time_horizon(&momentum, &[1.0], &config), TimeHorizon::ShortTerm);
    assert_eq!(time_horizon(&value, &[1.0], &config), TimeHorizon::LongTerm);
  }

  #[test]
  fn invalid_tilt_config_is_rejected() {
    let config = TiltConfig {
      sensitivity: 1.5,
      ..Default::default()
    };
    assert!(matches!(
      config.validate(),
      Err(PortfolioError::InvalidInput { .. })
    ));
  }
}
