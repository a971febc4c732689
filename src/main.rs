use std::env;
use std::fs;

use anyhow::Context;
use anyhow::Result;
use prettytable::Table;
use prettytable::row;
use serde::Deserialize;
use tiltfolio::AnalysisReport;
use tiltfolio::Asset;
use tiltfolio::PortfolioEngine;
use tiltfolio::PortfolioEngineConfig;
use tiltfolio::portfolio::FundamentalStrength;
use tiltfolio::portfolio::StrengthLabel;
use tracing_subscriber::EnvFilter;

/// Snapshot file: assets, optional engine settings, optional covariance.
#[derive(Deserialize)]
struct Snapshot {
  assets: Vec<Asset>,
  #[serde(default)]
  config: PortfolioEngineConfig,
  #[serde(default)]
  covariance: Option<Vec<Vec<f64>>>,
}

fn sample_snapshot() -> Snapshot {
  Snapshot {
    assets: vec![
      Asset::new("NVDA", 0.15, 0.207, 120.0)
        .with_technical(7.2)
        .with_sentiment(6.8)
        .with_fundamental(FundamentalStrength::Label(StrengthLabel::High)),
      Asset::new("AAPL", 0.12, 0.25, 190.0)
        .with_technical(5.9)
        .with_sentiment(6.1)
        .with_fundamental(FundamentalStrength::Label(StrengthLabel::Med)),
    ],
    config: PortfolioEngineConfig::default(),
    covariance: None,
  }
}

fn load_snapshot(path: &str) -> Result<Snapshot> {
  let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
  if raw.trim_start().starts_with('[') {
    let assets: Vec<Asset> =
      serde_json::from_str(&raw).with_context(|| format!("failed to parse assets in {path}"))?;
    return Ok(Snapshot {
      assets,
      config: PortfolioEngineConfig::default(),
      covariance: None,
    });
  }
  serde_json::from_str(&raw).with_context(|| format!("failed to parse snapshot {path}"))
}

fn pct(x: f64) -> String {
  format!("{:.2}%", x * 100.0)
}

fn print_report(report: &AnalysisReport) {
  let tickers = &report.final_allocation.tickers;

  let mut table = Table::new();
  let mut header = row!["Strategy", "Return", "Volatility", "Sharpe", "VaR 95%"];
  for t in tickers {
    header.add_cell(prettytable::Cell::new(t));
  }
  table.set_titles(header);

  for result in &report.strategies {
    let label = if result.is_degraded() {
      format!("{} (degraded)", result.name())
    } else {
      result.name().to_string()
    };
    let sharpe = result
      .sharpe()
      .map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}"));
    let mut line = row![
      label,
      pct(result.expected_return()),
      pct(result.volatility()),
      sharpe,
      pct(result.metrics.value_at_risk)
    ];
    for w in result.weights.iter() {
      line.add_cell(prettytable::Cell::new(&pct(*w)));
    }
    table.add_row(line);
  }

  let alloc = &report.final_allocation;
  let sharpe = alloc
    .metrics
    .sharpe
    .map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}"));
  let mut line = row![
    "Final allocation",
    pct(alloc.metrics.expected_return),
    pct(alloc.metrics.volatility),
    sharpe,
    pct(alloc.metrics.value_at_risk)
  ];
  for w in alloc.weights.iter() {
    line.add_cell(prettytable::Cell::new(&pct(*w)));
  }
  table.add_row(line);
  table.printstd();

  for failure in &report.failures {
    println!("skipped {}: {}", failure.strategy, failure.reason);
  }
  println!(
    "\nconfidence {:.1}/10, {}\n\n{}",
    alloc.confidence, alloc.time_horizon, alloc.rationale
  );
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "tiltfolio=info".into()))
    .init();

  let snapshot = match env::args().nth(1) {
    Some(path) => load_snapshot(&path)?,
    None => sample_snapshot(),
  };

  let engine = PortfolioEngine::new(snapshot.config);
  let report = match snapshot.covariance {
    Some(cov) => engine.run_with_covariance(&snapshot.assets, cov),
    None => engine.run(&snapshot.assets),
  }
  .context("portfolio analysis failed")?;

  print_report(&report);
  Ok(())
}
