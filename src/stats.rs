//! Shared numeric helpers: sample moments, quantiles, and the distribution
//! tails used for significance tests.
//!
//! All helpers treat their input as already filtered: callers strip missing
//! (NaN) entries with [`observed`] before calling. Quantiles use linear
//! interpolation between order statistics, matching the convention of
//! standard statistical software, and standard deviations use the n-1
//! denominator throughout.

use ndarray::Array1;

/// The non-missing, finite entries of a column, in row order.
pub fn observed(column: &Array1<f64>) -> Vec<f64> {
    column.iter().copied().filter(|v| v.is_finite()).collect()
}

pub fn sample_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation with the n-1 denominator. `None` for fewer
/// than two values.
pub fn sample_sd(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = sample_mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Linear-interpolation quantile (the "type 7" rule): the p-quantile sits
/// at rank (n-1)p between order statistics.
pub fn quantile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&p) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = h - lo as f64;
    Some(sorted[lo] + frac * (sorted[hi] - sorted[lo]))
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

/// Pearson correlation over paired values. `None` when fewer than two
/// pairs or either side has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mean_x = sample_mean(x)?;
    let mean_y = sample_mean(y)?;
    let mut num = 0.0;
    let mut den_x = 0.0;
    let mut den_y = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        num += dx * dy;
        den_x += dx * dx;
        den_y += dy * dy;
    }
    let den = (den_x * den_y).sqrt();
    if den > 0.0 { Some(num / den) } else { None }
}

/// Error function, Abramowitz & Stegun 7.1.26 (max absolute error 1.5e-7).
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly =
        ((((1.061405429 * t - 1.453152027) * t + 1.421413741) * t - 0.284496736) * t + 0.254829592)
            * t;
    sign * (1.0 - poly * (-x * x).exp())
}

pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Two-sided p-value for a standard-normal test statistic.
pub fn normal_two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

/// Survival function of the chi-square distribution: P(X > x) with `df`
/// degrees of freedom, via the regularized incomplete gamma function.
pub fn chi_square_sf(x: f64, df: f64) -> f64 {
    if df <= 0.0 {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 1.0;
    }
    let a = df / 2.0;
    let x2 = x / 2.0;
    if x2 < a + 1.0 {
        (1.0 - lower_gamma_series(a, x2)).clamp(0.0, 1.0)
    } else {
        upper_gamma_cf(a, x2).clamp(0.0, 1.0)
    }
}

/// Lanczos approximation (g = 7, 9 terms).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula keeps the half-integer arguments used by
        // chi-square tails accurate.
        let pi = std::f64::consts::PI;
        pi.ln() - (pi * x).sin().abs().ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut acc = COEFFS[0];
        for (i, &c) in COEFFS.iter().enumerate().skip(1) {
            acc += c / (x + i as f64);
        }
        let t = x + 7.5;
        0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
    }
}

/// Regularized lower incomplete gamma P(a, x) by series expansion.
/// Valid for x < a + 1.
fn lower_gamma_series(a: f64, x: f64) -> f64 {
    let mut term = 1.0 / a;
    let mut sum = term;
    let mut denom = a;
    for _ in 0..300 {
        denom += 1.0;
        term *= x / denom;
        sum += term;
        if term.abs() < sum.abs() * 1e-15 {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

/// Regularized upper incomplete gamma Q(a, x) by Lentz continued fraction.
/// Valid for x >= a + 1.
fn upper_gamma_cf(a: f64, x: f64) -> f64 {
    const TINY: f64 = 1e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / TINY;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..300 {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < TINY {
            d = TINY;
        }
        c = b + an / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < 1e-14 {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn sample_sd_uses_n_minus_one() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        // Sum of squared deviations is 32; 32 / 7 under the sample convention.
        assert_abs_diff_eq!(
            sample_sd(&values).unwrap(),
            (32.0f64 / 7.0).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn quantile_interpolates_between_order_statistics() {
        let values: Vec<f64> = (1..=9).map(|v| v as f64).collect();
        assert_abs_diff_eq!(quantile(&values, 0.33).unwrap(), 3.64, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile(&values, 0.66).unwrap(), 6.28, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile(&values, 0.0).unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile(&values, 1.0).unwrap(), 9.0, epsilon = 1e-12);
    }

    #[test]
    fn median_of_even_count_averages_middle_pair() {
        assert_abs_diff_eq!(
            median(&[1.0, 2.0, 3.0, 4.0]).unwrap(),
            2.5,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn pearson_recovers_perfect_correlation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        let y_rev = [8.0, 6.0, 4.0, 2.0];
        assert_abs_diff_eq!(pearson(&x, &y).unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pearson(&x, &y_rev).unwrap(), -1.0, epsilon = 1e-12);
        assert!(pearson(&x, &[1.0, 1.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn normal_cdf_matches_reference_points() {
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(normal_cdf(1.959964), 0.975, epsilon = 1e-6);
        assert_abs_diff_eq!(normal_cdf(-1.959964), 0.025, epsilon = 1e-6);
    }

    #[test]
    fn chi_square_sf_matches_reference_points() {
        // Critical values for alpha = 0.05.
        assert_abs_diff_eq!(chi_square_sf(3.841459, 1.0), 0.05, epsilon = 1e-6);
        assert_abs_diff_eq!(chi_square_sf(18.307038, 10.0), 0.05, epsilon = 1e-6);
        assert_abs_diff_eq!(chi_square_sf(0.0, 5.0), 1.0, epsilon = 1e-12);
        assert!(chi_square_sf(1000.0, 1.0) < 1e-12);
    }

    #[test]
    fn observed_drops_nan_entries() {
        let column = Array1::from_vec(vec![1.0, f64::NAN, 3.0]);
        assert_eq!(observed(&column), vec![1.0, 3.0]);
    }
}
