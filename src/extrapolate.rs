//! Extrapolates an initial guess for tear streams into a new time window
//! from their converged values in previous windows.

use crate::params::ExtrapolationMethod;

/// Extrapolate a scalar time series `(times, values)` to `t_new`.
///
/// `times` must be sorted ascending and have the same length as `values`.
/// Fewer than the number of anchor points a method needs falls back to the
/// simplest method that the available history supports (nearest, then
/// linear), rather than failing outright: the very first time window of a
/// run has no history at all to extrapolate from.
pub fn extrapolate(method: ExtrapolationMethod, times: &[f64], values: &[f64], t_new: f64) -> f64 {
    debug_assert_eq!(times.len(), values.len());
    if times.is_empty() {
        return 0.0;
    }
    if times.len() == 1 {
        return values[0];
    }
    match method {
        ExtrapolationMethod::Nearest => *values.last().unwrap(),
        ExtrapolationMethod::Linear => linear(times, values, t_new),
        ExtrapolationMethod::Spline => {
            if times.len() >= 3 {
                spline(times, values, t_new)
            } else {
                linear(times, values, t_new)
            }
        }
    }
}

fn linear(times: &[f64], values: &[f64], t_new: f64) -> f64 {
    let n = times.len();
    let (t0, t1) = (times[n - 2], times[n - 1]);
    let (v0, v1) = (values[n - 2], values[n - 1]);
    if (t1 - t0).abs() < 1e-300 {
        return v1;
    }
    v0 + (v1 - v0) * (t_new - t0) / (t1 - t0)
}

/// Natural cubic spline through the last three anchor points, evaluated at
/// `t_new` by extrapolating the final segment's cubic.
fn spline(times: &[f64], values: &[f64], t_new: f64) -> f64 {
    let n = times.len();
    let t = [times[n - 3], times[n - 2], times[n - 1]];
    let y = [values[n - 3], values[n - 2], values[n - 1]];

    let h0 = t[1] - t[0];
    let h1 = t[2] - t[1];
    if h0.abs() < 1e-300 || h1.abs() < 1e-300 {
        return linear(times, values, t_new);
    }

    // Natural boundary conditions (second derivative zero at both ends) on
    // three points reduce the tridiagonal system to a single equation for
    // the middle second derivative.
    let rhs = 6.0 * ((y[2] - y[1]) / h1 - (y[1] - y[0]) / h0);
    let denom = 2.0 * (h0 + h1);
    let m1 = if denom.abs() > 1e-300 { rhs / denom } else { 0.0 };
    let m0 = 0.0;
    let m2 = 0.0;

    // Evaluate the cubic on segment [t1, t2], extrapolated beyond t2 if
    // t_new lies outside it.
    let h = h1;
    let a = t[2] - t_new;
    let b = t_new - t[1];
    y[1] * a / h + y[2] * b / h
        - m1 * (a.powi(3) / h - h * a) / 6.0
        - m2 * (b.powi(3) / h - h * b) / 6.0
        + m0 * 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_returns_last_value_regardless_of_t_new() {
        let v = extrapolate(ExtrapolationMethod::Nearest, &[0.0, 1.0, 2.0], &[10.0, 20.0, 30.0], 100.0);
        assert_eq!(v, 30.0);
    }

    #[test]
    fn linear_extrapolates_past_the_last_two_points() {
        let v = extrapolate(ExtrapolationMethod::Linear, &[0.0, 1.0], &[0.0, 2.0], 2.0);
        assert!((v - 4.0).abs() < 1e-12);
    }

    #[test]
    fn linear_reproduces_exact_values_at_anchor_points() {
        let v = extrapolate(ExtrapolationMethod::Linear, &[0.0, 1.0, 2.0], &[0.0, 3.0, 6.0], 1.0);
        assert!((v - 3.0).abs() < 1e-9);
    }

    #[test]
    fn spline_reproduces_linear_data_exactly() {
        // A perfectly linear series has zero second derivative everywhere,
        // so the natural-boundary spline should extrapolate linearly too.
        let v = extrapolate(ExtrapolationMethod::Spline, &[0.0, 1.0, 2.0], &[0.0, 2.0, 4.0], 3.0);
        assert!((v - 6.0).abs() < 1e-6);
    }

    #[test]
    fn extrapolate_with_single_point_returns_that_value() {
        let v = extrapolate(ExtrapolationMethod::Linear, &[5.0], &[42.0], 99.0);
        assert_eq!(v, 42.0);
    }

    #[test]
    fn extrapolate_with_no_history_returns_zero() {
        let v = extrapolate(ExtrapolationMethod::Linear, &[], &[], 0.0);
        assert_eq!(v, 0.0);
    }
}
