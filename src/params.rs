//! Simulation-wide parameters consumed by the simulator.

use serde::{Deserialize, Serialize};

/// Method used to blend successive tear-stream iterates to a fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceMethod {
    Direct,
    Wegstein,
    Steffensen,
}

/// Method used to extrapolate an initial guess for tear streams into the
/// next time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtrapolationMethod {
    Linear,
    Spline,
    Nearest,
}

/// All tunables of the waveform-relaxation engine, with the documented
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametersHolder {
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub min_fraction: f64,

    pub end_simulation_time: f64,

    pub init_time_window: f64,
    pub min_time_window: f64,
    pub max_time_window: f64,
    pub max_iter: u32,
    pub iters_upper_limit: u32,
    pub iters_lower_limit: u32,
    pub iters_1st_upper_limit: u32,
    pub magnification_ratio: f64,

    pub convergence_method: ConvergenceMethod,
    pub relaxation_param: f64,
    pub wegstein_accel: f64,

    pub extrapolation_method: ExtrapolationMethod,

    pub save_time_step: f64,
    pub save_time_step_flag_holdups: bool,

    pub enthalpy_min_t: f64,
    pub enthalpy_max_t: f64,
    pub enthalpy_intervals: usize,

    pub cache_window: usize,
    pub cache_path: Option<std::path::PathBuf>,

    pub initialize_tear_streams_auto: bool,
}

impl Default for ParametersHolder {
    fn default() -> Self {
        ParametersHolder {
            abs_tol: 1e-6,
            rel_tol: 1e-3,
            min_fraction: 1e-9,
            end_simulation_time: 100.0,
            init_time_window: 1.0,
            min_time_window: 1e-9,
            max_time_window: 1e6,
            max_iter: 500,
            iters_upper_limit: 10,
            iters_lower_limit: 3,
            iters_1st_upper_limit: 20,
            magnification_ratio: 1.2,
            convergence_method: ConvergenceMethod::Direct,
            relaxation_param: 1.0,
            wegstein_accel: -5.0,
            extrapolation_method: ExtrapolationMethod::Linear,
            save_time_step: 0.0,
            save_time_step_flag_holdups: false,
            enthalpy_min_t: 273.15,
            enthalpy_max_t: 373.15,
            enthalpy_intervals: 100,
            cache_window: 100,
            cache_path: None,
            initialize_tear_streams_auto: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = ParametersHolder::default();
        assert_eq!(p.abs_tol, 1e-6);
        assert_eq!(p.rel_tol, 1e-3);
        assert_eq!(p.min_fraction, 1e-9);
        assert_eq!(p.init_time_window, 1.0);
        assert_eq!(p.min_time_window, 1e-9);
        assert_eq!(p.max_time_window, 1e6);
        assert_eq!(p.magnification_ratio, 1.2);
        assert_eq!(p.max_iter, 500);
        assert_eq!(p.cache_window, 100);
    }

    #[test]
    fn roundtrips_through_bincode() {
        let p = ParametersHolder::default();
        let bytes = bincode::serialize(&p).unwrap();
        let back: ParametersHolder = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.abs_tol, p.abs_tol);
        assert_eq!(back.cache_window, p.cache_window);
    }
}
