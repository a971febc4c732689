//! # tiltfolio
//!
//! $$
//! \mathbf{w}^\* = \operatorname{clip}\big(\mathbf{w}^{\text{base}} + k\,\mathbf{t}\big)
//! $$
//!
//! Five long-only allocation strategies over a shared risk model, blended with
//! a bounded qualitative tilt into one final allocation.
//!
//! ```ignore
//! use tiltfolio::Asset;
//! use tiltfolio::PortfolioEngine;
//!
//! let assets = vec![
//!   Asset::new("NVDA", 0.15, 0.207, 120.0),
//!   Asset::new("AAPL", 0.12, 0.25, 190.0),
//! ];
//! let report = PortfolioEngine::default().run(&assets)?;
//! println!("{}", report.final_allocation.rationale);
//! ```

pub mod error;
pub mod portfolio;

pub use error::PortfolioError;
pub use error::Result;
pub use portfolio::AnalysisReport;
pub use portfolio::Asset;
pub use portfolio::PortfolioEngine;
pub use portfolio::PortfolioEngineConfig;
pub use portfolio::StrategyKind;
