//! # Portfolio Data Utilities
//!
//! $$
//! \Sigma_{ij} = \sigma_i \sigma_j \rho_{ij}
//! $$
//!
//! Return preprocessing, correlation/covariance construction and the small
//! dense linear-algebra kernels the optimizers share.

fn sample_mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    0.0
  } else {
    xs.iter().sum::<f64>() / xs.len() as f64
  }
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
  let n = x.len().min(y.len());
  if n < 2 {
    return 0.0;
  }

  let mx = sample_mean(&x[..n]);
  let my = sample_mean(&y[..n]);

  let mut cov = 0.0;
  let mut sx = 0.0;
  let mut sy = 0.0;

  for i in 0..n {
    let dx = x[i] - mx;
    let dy = y[i] - my;
    cov += dx * dy;
    sx += dx * dx;
    sy += dy * dy;
  }

  let denom = (sx * sy).sqrt();
  if denom < 1e-15 {
    0.0
  } else {
    (cov / denom).clamp(-1.0, 1.0)
  }
}

/// Convert close prices to log-return series, skipping non-positive prices.
pub fn log_returns_series(closes: &[f64]) -> Vec<f64> {
  closes
    .windows(2)
    .filter(|w| w[0] > 0.0 && w[1] > 0.0)
    .map(|w| (w[1] / w[0]).ln())
    .collect()
}

/// Align multiple return series to their common tail length.
pub fn align_return_series(all_returns: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let min_len = all_returns.iter().map(|r| r.len()).min().unwrap_or(0);
  all_returns
    .iter()
    .map(|r| r[r.len() - min_len..].to_vec())
    .collect()
}

/// Pearson correlation matrix of aligned return series.
pub fn correlation_matrix(aligned_returns: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = aligned_returns.len();
  let mut corr = vec![vec![1.0; n]; n];

  for i in 0..n {
    for j in (i + 1)..n {
      let r = pearson(&aligned_returns[i], &aligned_returns[j]);
      corr[i][j] = r;
      corr[j][i] = r;
    }
  }

  corr
}

/// Correlation matrix with the same coefficient for every pair.
pub fn constant_correlation(n: usize, rho: f64) -> Vec<Vec<f64>> {
  (0..n)
    .map(|i| (0..n).map(|j| if i == j { 1.0 } else { rho }).collect())
    .collect()
}

/// Pairwise correlation from per-asset hints, `rho_ij = (h_i + h_j) / 2`.
///
/// A missing hint defers to the other asset's hint, then to `fallback`.
pub fn hinted_correlation(hints: &[Option<f64>], fallback: f64) -> Vec<Vec<f64>> {
  let n = hints.len();
  let mut corr = vec![vec![1.0; n]; n];

  for i in 0..n {
    for j in (i + 1)..n {
      let rho = match (hints[i], hints[j]) {
        (Some(a), Some(b)) => 0.5 * (a + b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => fallback,
      };
      corr[i][j] = rho;
      corr[j][i] = rho;
    }
  }

  corr
}

/// Covariance matrix from per-asset volatilities and a correlation matrix.
pub fn covariance_matrix(sigmas: &[f64], corr: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = sigmas.len();
  let mut cov = vec![vec![0.0; n]; n];

  for i in 0..n {
    for j in 0..n {
      let c_ij = corr
        .get(i)
        .and_then(|row| row.get(j))
        .copied()
        .unwrap_or(if i == j { 1.0 } else { 0.0 });
      cov[i][j] = if i == j {
        sigmas[i] * sigmas[i]
      } else {
        sigmas[i] * sigmas[j] * c_ij
      };
    }
  }

  cov
}

/// Correlation matrix implied by a covariance matrix.
pub fn corr_from_cov(cov: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let n = cov.len();
  let sigmas: Vec<f64> = (0..n).map(|i| cov[i][i].max(0.0).sqrt()).collect();
  let mut corr = vec![vec![0.0; n]; n];

  for i in 0..n {
    for j in 0..n {
      let denom = sigmas[i] * sigmas[j];
      corr[i][j] = if i == j {
        1.0
      } else if denom > 1e-15 {
        (cov[i][j] / denom).clamp(-1.0, 1.0)
      } else {
        0.0
      };
    }
  }

  corr
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub(crate) fn mat_vec_mul(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
  mat.iter().map(|row| dot(row, v)).collect()
}

/// `w' Sigma w`, floored at zero.
pub(crate) fn quad_form(mat: &[Vec<f64>], w: &[f64]) -> f64 {
  dot(w, &mat_vec_mul(mat, w)).max(0.0)
}
