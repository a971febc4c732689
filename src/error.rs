//! # Errors
//!
//! $$
//! \text{run} : \text{inputs} \to \text{Result}\langle \text{report}, \text{PortfolioError} \rangle
//! $$
//!
//! Error taxonomy shared by the risk model, the optimizers and the synthesizer.
//! Input errors are fatal; strategy errors are recorded per strategy and never
//! abort a run.

use thiserror::Error;

use crate::portfolio::types::StrategyKind;

/// Errors raised while building a risk model, solving a strategy or
/// synthesizing the final allocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
  /// Malformed or out-of-range asset data.
  #[error("invalid input for {field}: {reason}")]
  InvalidInput { field: String, reason: String },

  /// Fewer assets than a portfolio needs.
  #[error("insufficient data: need at least {required} assets, got {actual}")]
  InsufficientData { required: usize, actual: usize },

  /// The problem has no meaningful optimum for this strategy.
  #[error("degenerate problem for {strategy}: {reason}")]
  DegenerateProblem {
    strategy: StrategyKind,
    reason: String,
  },

  /// An iterative solver hit its iteration cap.
  #[error("{strategy} did not converge after {iterations} iterations (spread {spread:.3e})")]
  ConvergenceFailure {
    strategy: StrategyKind,
    iterations: usize,
    spread: f64,
  },

  /// The synthesizer has no base allocation to start from.
  #[error("no viable strategy: {0}")]
  NoViableStrategy(String),

  /// The caller's deadline expired before the strategy finished.
  #[error("{strategy} was aborted at the run deadline")]
  TimedOut { strategy: StrategyKind },
}

impl PortfolioError {
  pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::InvalidInput {
      field: field.into(),
      reason: reason.into(),
    }
  }

  /// Whether the engine recovers from this error with a documented fallback.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      Self::DegenerateProblem { .. } | Self::ConvergenceFailure { .. }
    )
  }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PortfolioError>;
