//! Empirical-Bayes variance moderation.
//!
//! Gene-wise residual variances are treated as draws from a scaled inverse
//! chi-square prior whose degrees of freedom `df` and scale `variance` are
//! estimated by matching the first two moments of `log s²`. Each gene's
//! variance is then shrunk towards the prior scale.

use log::debug;
use serde::Serialize;
use special::Gamma;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use statrs::function::gamma::digamma;

use crate::utils::statistics::median;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VariancePrior {
    /// Prior degrees of freedom; infinite when the variances show no excess spread.
    pub df: f64,
    pub variance: f64,
}

impl VariancePrior {
    pub fn none() -> Self {
        Self { df: 0.0, variance: 0.0 }
    }

    pub fn posterior_variance(&self, residual_variance: f64, residual_df: f64) -> f64 {
        if self.df.is_infinite() {
            self.variance
        } else if self.df <= 0.0 {
            residual_variance
        } else {
            (self.df * self.variance + residual_df * residual_variance) / (self.df + residual_df)
        }
    }
}

fn trigamma(x: f64) -> f64 {
    x.trigamma()
}

/// Second derivative of digamma by recurrence and asymptotic expansion.
fn tetragamma(x: f64) -> f64 {
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc -= 2.0 / (x * x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    let inv4 = inv2 * inv2;
    acc - inv2 - inv2 * inv - 0.5 * inv4 + inv4 * inv2 / 6.0 - inv4 * inv4 / 6.0
        + 0.3 * inv4 * inv4 * inv2
        - 5.0 * inv4 * inv4 * inv4 / 6.0
}

/// Solves `trigamma(y) = x` for `y` by Newton iteration.
pub fn trigamma_inverse(x: f64) -> f64 {
    if x > 1e7 {
        return 1.0 / x.sqrt();
    }
    if x < 1e-6 {
        return 1.0 / x;
    }
    let mut y = 0.5 + 1.0 / x;
    for _ in 0..50 {
        let tri = trigamma(y);
        let step = tri * (1.0 - tri / x) / tetragamma(y);
        y += step;
        if -step / y < 1e-8 {
            break;
        }
    }
    y
}

/// Moment fit of the scaled-F prior to residual variances sharing `df`.
pub fn fit_variance_prior(variances: &[f64], df: f64) -> VariancePrior {
    let finite: Vec<f64> = variances
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .collect();
    if finite.len() < 2 || df <= 0.0 {
        return VariancePrior::none();
    }

    let mid = median(&finite);
    if mid <= 0.0 {
        return VariancePrior::none();
    }
    let floor = 1e-5 * mid;

    let half_df = df / 2.0;
    let shift = digamma(half_df) - half_df.ln();
    let e: Vec<f64> = finite.iter().map(|&v| v.max(floor).ln() - shift).collect();
    let n = e.len() as f64;
    let e_mean = e.iter().sum::<f64>() / n;
    let e_var = e.iter().map(|x| (x - e_mean).powi(2)).sum::<f64>() / (n - 1.0) - trigamma(half_df);

    let prior = if e_var > 0.0 {
        let prior_df = 2.0 * trigamma_inverse(e_var);
        let variance = (e_mean + digamma(prior_df / 2.0) - (prior_df / 2.0).ln()).exp();
        VariancePrior { df: prior_df, variance }
    } else {
        VariancePrior {
            df: f64::INFINITY,
            variance: e_mean.exp(),
        }
    };
    debug!("Variance prior: df {:.3}, scale {:.5}", prior.df, prior.variance);
    prior
}

/// Two-sided tail probability of a t statistic; normal when `df` is infinite.
pub fn two_sided_p_value(t: f64, df: f64) -> f64 {
    if !t.is_finite() || df <= 0.0 {
        return 1.0;
    }
    let tail = if df.is_infinite() {
        match Normal::new(0.0, 1.0) {
            Ok(dist) => dist.sf(t.abs()),
            Err(_) => return 1.0,
        }
    } else {
        match StudentsT::new(0.0, 1.0, df) {
            Ok(dist) => dist.sf(t.abs()),
            Err(_) => return 1.0,
        }
    };
    (2.0 * tail).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigamma_inverse_round_trips() {
        for y in [0.3, 1.0, 2.5, 10.0, 150.0] {
            let x = trigamma(y);
            assert!((trigamma_inverse(x) - y).abs() / y < 1e-6, "y = {}", y);
        }
    }

    #[test]
    fn tetragamma_matches_finite_difference() {
        for x in [0.7, 1.5, 4.0, 12.0] {
            let h = 1e-5;
            let numeric = (trigamma(x + h) - trigamma(x - h)) / (2.0 * h);
            assert!((tetragamma(x) - numeric).abs() < 1e-5 * numeric.abs().max(1.0));
        }
    }

    #[test]
    fn identical_variances_give_infinite_prior_df() {
        let prior = fit_variance_prior(&[0.2, 0.2, 0.2, 0.2], 6.0);
        let expected = 0.2 * (3f64.ln() - digamma(3.0)).exp();
        assert!(prior.df.is_infinite());
        assert!((prior.variance - expected).abs() < 1e-12);
        assert_eq!(prior.posterior_variance(5.0, 6.0), prior.variance);
    }

    #[test]
    fn spread_variances_give_finite_prior() {
        let variances: Vec<f64> = (0..200)
            .map(|i| 0.1 * (-3.0 + 6.0 * i as f64 / 199.0).exp())
            .collect();
        let prior = fit_variance_prior(&variances, 4.0);
        assert!(prior.df.is_finite() && prior.df > 0.0);
        let shrunk = prior.posterior_variance(10.0, 4.0);
        assert!(shrunk < 10.0 && shrunk > prior.variance);
    }

    #[test]
    fn p_values_are_two_sided() {
        assert!((two_sided_p_value(0.0, 10.0) - 1.0).abs() < 1e-12);
        assert!((two_sided_p_value(1.959964, f64::INFINITY) - 0.05).abs() < 1e-5);
        assert!((two_sided_p_value(-2.0, 8.0) - two_sided_p_value(2.0, 8.0)).abs() < 1e-15);
        assert_eq!(two_sided_p_value(f64::NAN, 8.0), 1.0);
    }
}
