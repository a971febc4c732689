//! # Portfolio Engine
//!
//! $$
//! \text{assets} \xrightarrow{\ \text{RiskModel}\ } (\mu, \Sigma)
//! \xrightarrow{\ \text{strategies}\ } \{\mathbf{w}_s\}
//! \xrightarrow{\ \text{synthesize}\ } \mathbf{w}^\*
//! $$
//!
//! High-level orchestration API: one immutable run context, the strategy suite
//! (in parallel when enabled) and the final synthesis.

use std::time::Duration;

use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::metrics::MetricsConfig;
use super::optimizers::OptimizerConfig;
use super::optimizers::optimize_inverse_vol;
use super::optimizers::optimize_min_variance;
use super::optimizers::optimize_with_method;
use super::risk_model::RiskModel;
use super::risk_model::RiskModelConfig;
use super::synthesizer::TiltConfig;
use super::synthesizer::synthesize;
use super::types::AnalysisReport;
use super::types::Asset;
use super::types::Deadline;
use super::types::FinalAllocation;
use super::types::SolveStatus;
use super::types::StrategyFailure;
use super::types::StrategyKind;
use super::types::StrategyResult;
use super::types::SuiteOutcome;
use super::types::WeightVector;
use crate::error::PortfolioError;
use crate::error::Result;

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioEngineConfig {
  pub risk_model: RiskModelConfig,
  pub optimizer: OptimizerConfig,
  pub metrics: MetricsConfig,
  pub tilt: TiltConfig,
  /// Strategy the final allocation starts from.
  pub base_strategy: StrategyKind,
  /// Strategies to run; duplicates are ignored and order follows priority.
  pub strategies: Vec<StrategyKind>,
  /// Wall-clock budget for the strategy suite, in milliseconds.
  pub timeout_ms: Option<u64>,
  /// Run strategies on the rayon pool.
  pub parallel: bool,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      risk_model: RiskModelConfig::default(),
      optimizer: OptimizerConfig::default(),
      metrics: MetricsConfig::default(),
      tilt: TiltConfig::default(),
      base_strategy: StrategyKind::MaxSharpe,
      strategies: StrategyKind::ALL.to_vec(),
      timeout_ms: None,
      parallel: true,
    }
  }
}

impl PortfolioEngineConfig {
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_ms.map(Duration::from_millis)
  }

  fn validate(&self) -> Result<()> {
    self.metrics.validate()?;
    if !self.optimizer.risk_free.is_finite() {
      return Err(PortfolioError::invalid("optimizer.risk_free", "must be finite"));
    }
    if self.strategies.is_empty() {
      return Err(PortfolioError::invalid("strategies", "no strategy enabled"));
    }
    self.tilt.validate()
  }
}

/// Immutable state of one run, shared by reference with every strategy.
#[derive(Clone, Debug)]
pub struct RunContext {
  model: RiskModel,
  deadline: Deadline,
}

impl RunContext {
  pub fn new(model: RiskModel, deadline: Deadline) -> Self {
    Self { model, deadline }
  }

  pub fn model(&self) -> &RiskModel {
    &self.model
  }

  pub fn deadline(&self) -> &Deadline {
    &self.deadline
  }
}

/// Single entry-point engine for the strategy suite and final synthesis.
#[derive(Clone, Debug, Default)]
pub struct PortfolioEngine {
  config: PortfolioEngineConfig,
}

impl PortfolioEngine {
  /// Construct a new engine with explicit configuration.
  pub fn new(config: PortfolioEngineConfig) -> Self {
    Self { config }
  }

  /// Borrow engine configuration.
  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  /// Validate inputs, build the risk model and start the run clock.
  pub fn prepare(&self, assets: &[Asset]) -> Result<RunContext> {
    self.config.validate()?;
    let model = RiskModel::build(assets, &self.config.risk_model)?;
    Ok(RunContext::new(model, self.deadline()))
  }

  /// Like [`prepare`](Self::prepare) around a caller-supplied covariance matrix.
  pub fn prepare_with_covariance(
    &self,
    assets: &[Asset],
    covariance: Vec<Vec<f64>>,
  ) -> Result<RunContext> {
    self.config.validate()?;
    let model = RiskModel::from_covariance(assets, covariance, &self.config.risk_model)?;
    Ok(RunContext::new(model, self.deadline()))
  }

  fn deadline(&self) -> Deadline {
    self
      .config
      .timeout()
      .map_or_else(Deadline::none, Deadline::after)
  }

  fn enabled_strategies(&self) -> Vec<StrategyKind> {
    let mut kinds = self.config.strategies.clone();
    kinds.sort();
    kinds.dedup();
    kinds
  }

  /// Run one strategy, applying its documented fallback when it has one.
  pub fn run_strategy(
    &self,
    kind: StrategyKind,
    ctx: &RunContext,
  ) -> std::result::Result<StrategyResult, StrategyFailure> {
    let model = ctx.model();
    let opt = &self.config.optimizer;
    let fail = |reason: String| StrategyFailure {
      strategy: kind,
      reason,
    };
    let evaluate = |weights: WeightVector, status: SolveStatus| {
      StrategyResult::evaluate(kind, weights, status, model, &self.config.metrics)
        .map_err(|err| fail(err.to_string()))
    };

    let err = match optimize_with_method(kind, model, opt, ctx.deadline()) {
      Ok((weights, status)) => return evaluate(weights, status),
      Err(err) => err,
    };

    let fallback = match (&err, kind) {
      (PortfolioError::DegenerateProblem { .. }, StrategyKind::MaxSharpe) => Some((
        "minimum-variance weights",
        optimize_min_variance(model, opt, ctx.deadline()),
      )),
      (PortfolioError::ConvergenceFailure { .. }, StrategyKind::RiskParity) => Some((
        "inverse-volatility weights",
        optimize_inverse_vol(model).map(|w| (w, SolveStatus::Optimal)),
      )),
      _ => None,
    };

    match fallback {
      Some((label, Ok((weights, status)))) => {
        warn!(strategy = %kind, error = %err, "falling back to {label}");
        let reason = match status {
          SolveStatus::Optimal => format!("{err}; using {label}"),
          SolveStatus::Degraded { reason } => format!("{err}; using {label} ({reason})"),
        };
        evaluate(weights, SolveStatus::Degraded { reason })
      }
      Some((label, Err(fallback_err))) => {
        warn!(strategy = %kind, error = %err, fallback = %fallback_err, "fallback to {label} failed");
        Err(fail(format!("{err}; {label} also failed: {fallback_err}")))
      }
      None => {
        warn!(strategy = %kind, error = %err, "strategy failed");
        Err(fail(err.to_string()))
      }
    }
  }

  /// Run every enabled strategy against the context.
  ///
  /// Results and failures are reported in priority order whether or not the
  /// suite ran in parallel.
  pub fn optimize(&self, ctx: &RunContext) -> SuiteOutcome {
    let kinds = self.enabled_strategies();
    let runs: Vec<_> = if self.config.parallel {
      kinds
        .par_iter()
        .map(|&kind| self.run_strategy(kind, ctx))
        .collect()
    } else {
      kinds
        .iter()
        .map(|&kind| self.run_strategy(kind, ctx))
        .collect()
    };

    let mut outcome = SuiteOutcome::default();
    for run in runs {
      match run {
        Ok(result) => outcome.results.push(result),
        Err(failure) => outcome.failures.push(failure),
      }
    }
    outcome
  }

  /// Blend the configured base strategy with the qualitative tilt.
  pub fn synthesize(&self, ctx: &RunContext, outcome: &SuiteOutcome) -> Result<FinalAllocation> {
    synthesize(
      outcome,
      ctx.model(),
      self.config.base_strategy,
      &self.config.tilt,
      &self.config.metrics,
    )
  }

  /// Full pipeline on asset inputs.
  pub fn run(&self, assets: &[Asset]) -> Result<AnalysisReport> {
    let ctx = self.prepare(assets)?;
    self.finish(&ctx)
  }

  /// Full pipeline around a caller-supplied covariance matrix.
  pub fn run_with_covariance(
    &self,
    assets: &[Asset],
    covariance: Vec<Vec<f64>>,
  ) -> Result<AnalysisReport> {
    let ctx = self.prepare_with_covariance(assets, covariance)?;
    self.finish(&ctx)
  }

  fn finish(&self, ctx: &RunContext) -> Result<AnalysisReport> {
    let outcome = self.optimize(ctx);
    let final_allocation = self.synthesize(ctx, &outcome)?;

    info!(
      assets = ctx.model().len(),
      completed = outcome.results.len(),
      failed = outcome.failures.len(),
      base = %final_allocation.base_strategy,
      confidence = final_allocation.confidence,
      "portfolio analysis complete"
    );

    Ok(AnalysisReport {
      strategies: outcome.results,
      failures: outcome.failures,
      final_allocation,
    })
  }
}
