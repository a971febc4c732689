use std::hint::black_box;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tiltfolio::Asset;
use tiltfolio::PortfolioEngine;
use tiltfolio::PortfolioEngineConfig;
use tiltfolio::StrategyKind;
use tiltfolio::portfolio::Deadline;
use tiltfolio::portfolio::OptimizerConfig;
use tiltfolio::portfolio::optimize_with_method;

const HISTORY: usize = 252;

fn universe(n: usize) -> Vec<Asset> {
  let mut rng = StdRng::seed_from_u64(42);
  let market: Vec<f64> = (0..HISTORY).map(|_| rng.gen_range(-0.02..0.02)).collect();

  (0..n)
    .map(|i| {
      let beta = rng.gen_range(0.5..1.5);
      let returns = market
        .iter()
        .map(|m| beta * m + rng.gen_range(-0.015..0.015))
        .collect();
      Asset::new(
        format!("A{i:02}"),
        rng.gen_range(0.02..0.18),
        rng.gen_range(0.12..0.45),
        100.0,
      )
      .with_returns(returns)
      .with_sentiment(rng.gen_range(2.0..9.0))
    })
    .collect()
}

fn bench_suite(c: &mut Criterion) {
  let mut group = c.benchmark_group("suite");

  for n in [2, 8, 32] {
    let assets = universe(n);
    for parallel in [false, true] {
      let engine = PortfolioEngine::new(PortfolioEngineConfig {
        parallel,
        ..Default::default()
      });
      let id = if parallel { "parallel" } else { "sequential" };
      group.bench_with_input(BenchmarkId::new(id, n), &assets, |b, assets| {
        b.iter(|| black_box(engine.run(assets)))
      });
    }
  }

  group.finish();
}

fn bench_strategies(c: &mut Criterion) {
  let mut group = c.benchmark_group("strategy");
  let engine = PortfolioEngine::default();
  let Ok(ctx) = engine.prepare(&universe(16)) else {
    return;
  };
  let config = OptimizerConfig::default();

  for kind in StrategyKind::ALL {
    group.bench_function(kind.name(), |b| {
      b.iter(|| black_box(optimize_with_method(kind, ctx.model(), &config, &Deadline::none())))
    });
  }

  group.finish();
}

criterion_group!(benches, bench_suite, bench_strategies);
criterion_main!(benches);
