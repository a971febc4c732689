//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Risk model, allocation strategies, portfolio metrics and the synthesis of
//! one final allocation from them.

pub mod data;
pub mod engine;
pub mod hrp;
pub mod metrics;
pub mod optimizers;
pub mod risk_model;
pub mod risk_parity;
pub mod synthesizer;
pub mod types;

pub use data::align_return_series;
pub use data::correlation_matrix;
pub use data::covariance_matrix;
pub use data::log_returns_series;
pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use engine::RunContext;
pub use hrp::Linkage;
pub use hrp::optimize_hrp;
pub use metrics::MetricsConfig;
pub use metrics::PortfolioMetrics;
pub use optimizers::OptimizerConfig;
pub use optimizers::optimize_inverse_vol;
pub use optimizers::optimize_max_diversification;
pub use optimizers::optimize_max_sharpe;
pub use optimizers::optimize_min_variance;
pub use optimizers::optimize_with_method;
pub use risk_model::CorrelationSource;
pub use risk_model::RiskModel;
pub use risk_model::RiskModelConfig;
pub use risk_parity::optimize_risk_parity;
pub use synthesizer::TiltConfig;
pub use synthesizer::synthesize;
pub use types::AnalysisReport;
pub use types::Asset;
pub use types::Deadline;
pub use types::FinalAllocation;
pub use types::FundamentalStrength;
pub use types::SolveStatus;
pub use types::StrategyFailure;
pub use types::StrategyKind;
pub use types::StrategyResult;
pub use types::StrengthLabel;
pub use types::SuiteOutcome;
pub use types::TimeHorizon;
pub use types::WeightVector;
