//! Fixed-point accelerators applied to tear-stream iterates within one
//! partition, one time window.
//!
//! Each accelerator works per scalar component of the flattened tear-stream
//! vector; the simulator is responsible for flattening/unflattening streams
//! into `&[f64]` slices (mass, temperature, pressure, phase fractions,
//! compositions, distribution classes all concatenated in a fixed order).

use crate::params::ConvergenceMethod;

/// Accumulated per-component history needed by Wegstein and Steffensen
/// across iterations of a single time window.
#[derive(Debug, Clone, Default)]
pub struct AcceleratorState {
    method: Option<ConvergenceMethod>,
    /// Previous guess and previous computed value, one pair back.
    prev_guess: Option<Vec<f64>>,
    prev_value: Option<Vec<f64>>,
    /// Iteration counter within the current window, used to trigger the
    /// every-third-iteration Steffensen update.
    iteration: u32,
    /// Rolling buffer of the last three Steffensen inputs.
    steffensen_buffer: Vec<Vec<f64>>,
}

impl AcceleratorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-window history; called at the start of every new time
    /// window since Wegstein/Steffensen history does not carry across
    /// windows (the extrapolated guess replaces it).
    pub fn reset_for_window(&mut self) {
        self.prev_guess = None;
        self.prev_value = None;
        self.iteration = 0;
        self.steffensen_buffer.clear();
    }

    /// Given the guess fed into this iteration (`guess`) and the freshly
    /// computed value from simulating the partition with that guess
    /// (`computed`), produce the next guess to try.
    pub fn accelerate(
        &mut self,
        method: ConvergenceMethod,
        relaxation: f64,
        wegstein_clamp: f64,
        guess: &[f64],
        computed: &[f64],
    ) -> Vec<f64> {
        debug_assert_eq!(guess.len(), computed.len());
        self.method = Some(method);
        self.iteration += 1;

        let next = match method {
            ConvergenceMethod::Direct => direct_substitution(guess, computed, relaxation),
            ConvergenceMethod::Wegstein => {
                let result = match (&self.prev_guess, &self.prev_value) {
                    (Some(pg), Some(pv)) => wegstein(pg, pv, guess, computed, wegstein_clamp),
                    _ => direct_substitution(guess, computed, relaxation),
                };
                result
            }
            ConvergenceMethod::Steffensen => {
                self.steffensen_buffer.push(computed.to_vec());
                if self.steffensen_buffer.len() >= 3 && self.iteration % 3 == 0 {
                    let x0 = &self.steffensen_buffer[self.steffensen_buffer.len() - 3];
                    let x1 = &self.steffensen_buffer[self.steffensen_buffer.len() - 2];
                    let x2 = &self.steffensen_buffer[self.steffensen_buffer.len() - 1];
                    steffensen(x0, x1, x2)
                } else {
                    direct_substitution(guess, computed, relaxation)
                }
            }
        };

        self.prev_guess = Some(guess.to_vec());
        self.prev_value = Some(computed.to_vec());
        next
    }

    /// Residual used by the simulator's convergence test: `computed - guess`
    /// component-wise, both in absolute and relative terms are left to the
    /// caller (it knows the physical scale of each component).
    pub fn residual(guess: &[f64], computed: &[f64]) -> Vec<f64> {
        guess.iter().zip(computed).map(|(g, c)| c - g).collect()
    }
}

/// `x_{k+1} = x_k + rho * (f(x_k) - x_k)`.
fn direct_substitution(guess: &[f64], computed: &[f64], relaxation: f64) -> Vec<f64> {
    guess.iter().zip(computed)
        .map(|(g, c)| g + relaxation * (c - g))
        .collect()
}

/// Wegstein's method: per-component secant acceleration of direct
/// substitution. The slope `s_i = (c_i - c_i_prev) / (g_i - g_i_prev)` is
/// turned into the acceleration factor `q_i = s_i / (s_i - 1)`, which is
/// then clamped to `[clamp, 1)` before blending.
fn wegstein(prev_guess: &[f64], prev_computed: &[f64], guess: &[f64], computed: &[f64], clamp: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(guess.len());
    for i in 0..guess.len() {
        let dg = guess[i] - prev_guess[i];
        let q = if dg.abs() > 1e-300 {
            let s = (computed[i] - prev_computed[i]) / dg;
            (s / (s - 1.0)).clamp(clamp, 1.0 - f64::EPSILON)
        } else {
            0.0
        };
        out.push(q * guess[i] + (1.0 - q) * computed[i]);
    }
    out
}

/// Steffensen's method (Aitken's delta-squared): given three successive
/// direct-substitution iterates `x0, x1, x2`, extrapolate the fixed point
/// per component as `x0 - (x1-x0)^2 / (x2 - 2*x1 + x0)`. Falls back to the
/// latest iterate when the denominator vanishes.
fn steffensen(x0: &[f64], x1: &[f64], x2: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(x0.len());
    for i in 0..x0.len() {
        let d1 = x1[i] - x0[i];
        let denom = x2[i] - 2.0 * x1[i] + x0[i];
        let v = if denom.abs() > 1e-300 {
            x0[i] - d1 * d1 / denom
        } else {
            x2[i]
        };
        out.push(v);
    }
    out
}
