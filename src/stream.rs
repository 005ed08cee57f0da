//! Material streams: the value object flowing on flowsheet arcs.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};
use crate::matrix::{DistributedMatrix, Slice};

/// Index into the fixed `overall` property vector.
pub const OVERALL_MASS: usize = 0;
pub const OVERALL_TEMPERATURE: usize = 1;
pub const OVERALL_PRESSURE: usize = 2;

/// Kahan-compensated summation, used once class counts exceed ~10^3 to keep
/// PSD and composition sums well-conditioned.
pub fn kahan_sum(values: &[f64]) -> f64 {
    if values.len() <= 1000 {
        return values.iter().sum();
    }
    let mut sum = 0.0_f64;
    let mut c = 0.0_f64;
    for &v in values {
        let y = v - c;
        let t = sum + y;
        c = (t - sum) - y;
        sum = t;
    }
    sum
}

/// Renormalise a non-negative vector to sum to one; left untouched if the
/// sum is zero (nothing to distribute).
fn normalize_sum_to_one(values: &mut [f64]) {
    let sum = kahan_sum(values);
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// A named material stream: overall properties, phase fractions, per-phase
/// compositions, and per-solid-compound particle distributions, all
/// time-indexed.
pub struct MaterialStream {
    pub key: String,
    compounds: Vec<String>,
    phases: Vec<String>,
    solid_phase: String,
    dist_shape: Vec<usize>,

    overall: DistributedMatrix,
    phase_fraction: DistributedMatrix,
    phase_composition: HashMap<String, DistributedMatrix>,
    solid_distribution: HashMap<String, DistributedMatrix>,
}

impl MaterialStream {
    pub fn new(
        key: impl Into<String>,
        compounds: Vec<String>,
        phases: Vec<String>,
        solid_phase: impl Into<String>,
        dist_shape: Vec<usize>,
        cache_window: usize,
        cache_dir: Option<PathBuf>,
    ) -> Self {
        let mut phase_composition = HashMap::new();
        let mut solid_distribution = HashMap::new();
        for phase in &phases {
            phase_composition.insert(
                phase.clone(),
                DistributedMatrix::with_cache(vec![compounds.len()], cache_window, cache_dir.clone()),
            );
        }
        for compound in &compounds {
            solid_distribution.insert(
                compound.clone(),
                DistributedMatrix::with_cache(dist_shape.clone(), cache_window, cache_dir.clone()),
            );
        }
        MaterialStream {
            key: key.into(),
            compounds,
            phases,
            solid_phase: solid_phase.into(),
            dist_shape,
            overall: DistributedMatrix::with_cache(vec![3], cache_window, cache_dir.clone()),
            phase_fraction: DistributedMatrix::with_cache(vec![phase_composition.len().max(1)], cache_window, cache_dir),
            phase_composition,
            solid_distribution,
        }
    }

    pub fn compounds(&self) -> &[String] {
        &self.compounds
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    fn phase_index(&self, phase: &str) -> EngineResult<usize> {
        self.phases.iter().position(|p| p == phase)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown phase '{phase}'")))
    }

    fn compound_index(&self, compound: &str) -> EngineResult<usize> {
        self.compounds.iter().position(|c| c == compound)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown compound '{compound}'")))
    }

    // -- Overall properties --

    pub fn mass(&mut self, t: f64) -> EngineResult<f64> {
        self.overall.get_value(t, &[OVERALL_MASS])
    }

    pub fn set_mass(&mut self, t: f64, v: f64) -> EngineResult<()> {
        if v < 0.0 {
            return Err(EngineError::InvalidTarget("mass must be non-negative".into()));
        }
        self.overall.set_value(t, &[OVERALL_MASS], v)
    }

    pub fn temperature(&mut self, t: f64) -> EngineResult<f64> {
        self.overall.get_value(t, &[OVERALL_TEMPERATURE])
    }

    pub fn set_temperature(&mut self, t: f64, v: f64) -> EngineResult<()> {
        if v <= 0.0 {
            return Err(EngineError::InvalidTarget("temperature must be positive".into()));
        }
        self.overall.set_value(t, &[OVERALL_TEMPERATURE], v)
    }

    pub fn pressure(&mut self, t: f64) -> EngineResult<f64> {
        self.overall.get_value(t, &[OVERALL_PRESSURE])
    }

    pub fn set_pressure(&mut self, t: f64, v: f64) -> EngineResult<()> {
        if v < 0.0 {
            return Err(EngineError::InvalidTarget("pressure must be non-negative".into()));
        }
        self.overall.set_value(t, &[OVERALL_PRESSURE], v)
    }

    // -- Phase fractions --

    pub fn phase_fraction(&mut self, phase: &str, t: f64) -> EngineResult<f64> {
        let idx = self.phase_index(phase)?;
        self.phase_fraction.get_value(t, &[idx])
    }

    pub fn set_phase_fraction(&mut self, phase: &str, t: f64, v: f64) -> EngineResult<()> {
        let idx = self.phase_index(phase)?;
        self.phase_fraction.set_value(t, &[idx], v)
    }

    pub fn set_phase_fractions(&mut self, t: f64, fractions: &[f64]) -> EngineResult<()> {
        if fractions.len() != self.phases.len() {
            return Err(EngineError::InvalidTarget("phase fraction vector length mismatch".into()));
        }
        self.phase_fraction.set_time_point(t, Slice { data: fractions.to_vec() });
        Ok(())
    }

    // -- Phase composition --

    pub fn phase_composition(&mut self, phase: &str, compound: &str, t: f64) -> EngineResult<f64> {
        let c_idx = self.compound_index(compound)?;
        let matrix = self.phase_composition.get_mut(phase)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown phase '{phase}'")))?;
        matrix.get_value(t, &[c_idx])
    }

    pub fn set_phase_composition(&mut self, phase: &str, t: f64, fractions: &[f64]) -> EngineResult<()> {
        if fractions.len() != self.compounds.len() {
            return Err(EngineError::InvalidTarget("composition vector length mismatch".into()));
        }
        let matrix = self.phase_composition.get_mut(phase)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown phase '{phase}'")))?;
        matrix.set_time_point(t, Slice { data: fractions.to_vec() });
        Ok(())
    }

    // -- Solid distributions --

    pub fn solid_distribution(&mut self, compound: &str, t: f64) -> EngineResult<Slice> {
        let matrix = self.solid_distribution.get_mut(compound)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown compound '{compound}'")))?;
        matrix.get_time_point(t)
    }

    pub fn set_solid_distribution(&mut self, compound: &str, t: f64, slice: Slice) -> EngineResult<()> {
        let matrix = self.solid_distribution.get_mut(compound)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown compound '{compound}'")))?;
        matrix.set_time_point(t, slice);
        Ok(())
    }

    pub fn dist_shape(&self) -> &[usize] {
        &self.dist_shape
    }

    // -- Lifecycle --

    /// Copy all data in `[t1, t2]` from `other` into `self`.
    pub fn copy_from(&mut self, other: &mut MaterialStream, t1: f64, t2: f64) -> EngineResult<()> {
        for &t in other.overall.time_points().to_vec().iter().filter(|&&t| t >= t1 && t <= t2) {
            let s = other.overall.get_time_point(t)?;
            self.overall.set_time_point(t, s);
        }
        for &t in other.phase_fraction.time_points().to_vec().iter().filter(|&&t| t >= t1 && t <= t2) {
            let s = other.phase_fraction.get_time_point(t)?;
            self.phase_fraction.set_time_point(t, s);
        }
        for phase in self.phases.clone() {
            if let Some(src) = other.phase_composition.get_mut(&phase) {
                let times: Vec<f64> = src.time_points().to_vec();
                for t in times.into_iter().filter(|&t| t >= t1 && t <= t2) {
                    let s = src.get_time_point(t)?;
                    self.phase_composition.get_mut(&phase).unwrap().set_time_point(t, s);
                }
            }
        }
        for compound in self.compounds.clone() {
            if let Some(src) = other.solid_distribution.get_mut(&compound) {
                let times: Vec<f64> = src.time_points().to_vec();
                for t in times.into_iter().filter(|&t| t >= t1 && t <= t2) {
                    let s = src.get_time_point(t)?;
                    self.solid_distribution.get_mut(&compound).unwrap().set_time_point(t, s);
                }
            }
        }
        Ok(())
    }

    /// Truncate every internal matrix at `t` (inclusive).
    pub fn remove_time_points_after(&mut self, t: f64) {
        self.overall.remove_time_points_after(t, true);
        self.phase_fraction.remove_time_points_after(t, true);
        for m in self.phase_composition.values_mut() {
            m.remove_time_points_after(t, true);
        }
        for m in self.solid_distribution.values_mut() {
            m.remove_time_points_after(t, true);
        }
    }

    /// Truncate every internal matrix strictly after `t`, keeping `t` itself.
    /// Used to roll a stream back to a window's starting point.
    pub fn remove_time_points_strictly_after(&mut self, t: f64) {
        self.overall.remove_time_points_after(t, false);
        self.phase_fraction.remove_time_points_after(t, false);
        for m in self.phase_composition.values_mut() {
            m.remove_time_points_after(t, false);
        }
        for m in self.solid_distribution.values_mut() {
            m.remove_time_points_after(t, false);
        }
    }

    /// Mass-weighted mixing of `self` and `other` at time `t`; the result
    /// replaces `self` at `t`. Scalars and phase fractions are weighted by
    /// overall mass, compositions by per-phase mass, distributions by
    /// per-compound solid-phase mass.
    pub fn mix_with(&mut self, other: &mut MaterialStream, t: f64) -> EngineResult<()> {
        let m1 = self.mass(t)?;
        let m2 = other.mass(t)?;
        let total = m1 + m2;
        let w1 = if total > 0.0 { m1 / total } else { 0.5 };
        let w2 = 1.0 - w1;

        let t1 = self.temperature(t)?;
        let t2 = other.temperature(t)?;
        let p1 = self.pressure(t)?;
        let p2 = other.pressure(t)?;
        self.set_mass(t, total)?;
        self.set_temperature(t, w1 * t1 + w2 * t2)?;
        self.set_pressure(t, w1 * p1 + w2 * p2)?;

        let mut fractions = Vec::with_capacity(self.phases.len());
        let mut phase_masses = Vec::with_capacity(self.phases.len());
        let mut phase_fracs1 = Vec::with_capacity(self.phases.len());
        let mut phase_fracs2 = Vec::with_capacity(self.phases.len());
        for phase in self.phases.clone() {
            let f1 = self.phase_fraction(&phase, t)?;
            let f2 = other.phase_fraction(&phase, t)?;
            let blended = if total > 0.0 { (f1 * m1 + f2 * m2) / total } else { 0.0 };
            fractions.push(blended);
            phase_masses.push(blended * total);
            phase_fracs1.push(f1);
            phase_fracs2.push(f2);
        }
        self.set_phase_fractions(t, &fractions)?;

        for (i, phase) in self.phases.clone().into_iter().enumerate() {
            let phase_mass = phase_masses[i];
            let n = self.compounds.len();
            let mut blended_comp = vec![0.0; n];
            let have_comp1: Vec<f64> = (0..n).map(|i| {
                self.phase_composition.get_mut(&phase).unwrap()
                    .get_value(t, &[i]).unwrap_or(0.0)
            }).collect();
            let have_comp2: Vec<f64> = (0..n).map(|i| {
                other.phase_composition.get_mut(&phase).map(|m| m.get_value(t, &[i]).unwrap_or(0.0)).unwrap_or(0.0)
            }).collect();
            // Weight by each stream's phase mass, not its total stream mass.
            let w_this = m1 * phase_fracs1[i];
            let w_other = m2 * phase_fracs2[i];
            let denom = w_this + w_other;
            for i in 0..n {
                blended_comp[i] = if denom > 0.0 {
                    (have_comp1[i] * w_this + have_comp2[i] * w_other) / denom
                } else {
                    0.0
                };
            }
            if phase_mass > 0.0 {
                self.set_phase_composition(&phase, t, &blended_comp)?;
            }
        }

        for compound in self.compounds.clone() {
            let shape_len: usize = self.dist_shape.iter().product::<usize>().max(1);
            let d1 = self.solid_distribution(&compound, t).map(|s| s.data).unwrap_or_else(|_| vec![0.0; shape_len]);
            let d2 = other.solid_distribution(&compound, t).map(|s| s.data).unwrap_or_else(|_| vec![0.0; shape_len]);
            // Weight by each stream's solid-phase mass of this compound.
            let solid_frac1 = self.phase_fraction(&self.solid_phase.clone(), t).unwrap_or(0.0);
            let solid_frac2 = other.phase_fraction(&other.solid_phase.clone(), t).unwrap_or(0.0);
            let comp1 = self.phase_composition(&self.solid_phase.clone(), &compound, t).unwrap_or(0.0);
            let comp2 = other.phase_composition(&other.solid_phase.clone(), &compound, t).unwrap_or(0.0);
            let w1m = m1 * solid_frac1 * comp1;
            let w2m = m2 * solid_frac2 * comp2;
            let denom = w1m + w2m;
            let blended: Vec<f64> = if denom > 0.0 {
                d1.iter().zip(d2.iter()).map(|(a, b)| (a * w1m + b * w2m) / denom).collect()
            } else {
                d1
            };
            self.set_solid_distribution(&compound, t, Slice { data: blended })?;
        }

        Ok(())
    }

    // -- Tear-stream flattening --

    /// Length of the vector produced by [`Self::tear_vector`]: 3 overall
    /// scalars, one phase fraction per phase, one composition fraction per
    /// (phase, compound) pair, and one distribution bin per (compound, grid
    /// class).
    pub fn tear_vector_len(&self) -> usize {
        let bins = self.dist_shape.iter().product::<usize>().max(1);
        3 + self.phases.len() + self.phases.len() * self.compounds.len() + self.compounds.len() * bins
    }

    /// Flatten every matrix this stream carries at `t` into a single vector,
    /// in the fixed order: overall (mass, temperature, pressure), phase
    /// fractions, each phase's composition, each compound's solid
    /// distribution. Missing entries (e.g. a never-written distribution)
    /// read as zero rather than failing, since a tear stream's first window
    /// may not yet carry every matrix.
    pub fn tear_vector(&mut self, t: f64) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.tear_vector_len());
        out.push(self.mass(t).unwrap_or(0.0));
        out.push(self.temperature(t).unwrap_or(300.0));
        out.push(self.pressure(t).unwrap_or(1e5));
        for phase in self.phases.clone() {
            out.push(self.phase_fraction(&phase, t).unwrap_or(0.0));
        }
        for phase in self.phases.clone() {
            for compound in self.compounds.clone() {
                out.push(self.phase_composition(&phase, &compound, t).unwrap_or(0.0));
            }
        }
        let bins = self.dist_shape.iter().product::<usize>().max(1);
        for compound in self.compounds.clone() {
            let slice = self.solid_distribution(&compound, t).map(|s| s.data).unwrap_or_else(|_| vec![0.0; bins]);
            out.extend(slice);
        }
        out
    }

    /// A reasonable tear-vector guess when no history or user-provided value
    /// exists yet: ambient scalars and a uniform split across phases,
    /// compositions, and distribution bins.
    pub fn default_tear_guess(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.tear_vector_len());
        out.extend_from_slice(&[1.0, 300.0, 1e5]);
        let n_phases = self.phases.len().max(1);
        out.extend(std::iter::repeat(1.0 / n_phases as f64).take(self.phases.len()));
        let n_compounds = self.compounds.len().max(1);
        for _ in &self.phases {
            out.extend(std::iter::repeat(1.0 / n_compounds as f64).take(self.compounds.len()));
        }
        let bins = self.dist_shape.iter().product::<usize>().max(1);
        for _ in &self.compounds {
            out.extend(std::iter::repeat(1.0 / bins as f64).take(bins));
        }
        out
    }

    /// Write back a vector shaped like [`Self::tear_vector`], renormalising
    /// phase fractions, each phase's composition, and each compound's solid
    /// distribution to sum to one.
    pub fn apply_tear_vector(&mut self, t: f64, values: &[f64]) -> EngineResult<()> {
        let mut i = 0;
        self.set_mass(t, values[i].max(0.0))?; i += 1;
        self.set_temperature(t, values[i].max(1e-9))?; i += 1;
        self.set_pressure(t, values[i].max(0.0))?; i += 1;

        let n_phases = self.phases.len();
        let mut fractions: Vec<f64> = values[i..i + n_phases].iter().map(|v| v.clamp(0.0, 1.0)).collect();
        i += n_phases;
        normalize_sum_to_one(&mut fractions);
        self.set_phase_fractions(t, &fractions)?;

        let n_compounds = self.compounds.len();
        for phase in self.phases.clone() {
            let mut comp: Vec<f64> = values[i..i + n_compounds].iter().map(|v| v.clamp(0.0, 1.0)).collect();
            i += n_compounds;
            normalize_sum_to_one(&mut comp);
            self.set_phase_composition(&phase, t, &comp)?;
        }

        let bins = self.dist_shape.iter().product::<usize>().max(1);
        for compound in self.compounds.clone() {
            let mut dist: Vec<f64> = values[i..i + bins].iter().map(|v| v.clamp(0.0, 1.0)).collect();
            i += bins;
            normalize_sum_to_one(&mut dist);
            self.set_solid_distribution(&compound, t, Slice { data: dist })?;
        }
        Ok(())
    }

    // -- Invariant checks --

    pub fn check_invariants(&mut self, t: f64, eps_min: f64) -> EngineResult<()> {
        if self.mass(t)? < 0.0 {
            return Err(EngineError::StructuralError("mass is negative".into()));
        }
        if self.temperature(t)? <= 0.0 {
            return Err(EngineError::StructuralError("temperature is not positive".into()));
        }
        let fractions: Vec<f64> = self.phases.clone().iter()
            .map(|p| self.phase_fraction(p, t).unwrap_or(0.0))
            .collect();
        let sum = kahan_sum(&fractions);
        if (sum - 1.0).abs() > eps_min.max(1e-6) {
            return Err(EngineError::StructuralError(format!("phase fractions sum to {sum}, expected 1")));
        }
        for (i, phase) in self.phases.clone().iter().enumerate() {
            if fractions[i] <= eps_min {
                continue;
            }
            let n = self.compounds.len();
            let comp: Vec<f64> = (0..n).map(|c| self.phase_composition(phase, &self.compounds[c].clone(), t).unwrap_or(0.0)).collect();
            let csum = kahan_sum(&comp);
            if (csum - 1.0).abs() > eps_min.max(1e-6) {
                return Err(EngineError::StructuralError(format!(
                    "phase '{phase}' composition sums to {csum}, expected 1"
                )));
            }
        }
        for compound in self.compounds.clone() {
            let dist = self.solid_distribution(&compound, t)?.data;
            if dist.is_empty() {
                continue;
            }
            let dsum = kahan_sum(&dist);
            if (dsum - 1.0).abs() > eps_min.max(1e-6) {
                return Err(EngineError::StructuralError(format!(
                    "compound '{compound}' solid distribution sums to {dsum}, expected 1"
                )));
            }
        }
        Ok(())
    }

    // -- PSD derived quantities --

    /// Mass-fraction density distribution `q3` over diameter classes.
    pub fn q3(&mut self, compound: &str, t: f64) -> EngineResult<Vec<f64>> {
        Ok(self.solid_distribution(compound, t)?.data)
    }

    /// Cumulative mass distribution `Q3`.
    pub fn cumulative_q3(&mut self, compound: &str, t: f64) -> EngineResult<Vec<f64>> {
        let q3 = self.q3(compound, t)?;
        let mut acc = 0.0;
        Ok(q3.into_iter().map(|v| { acc += v; acc }).collect())
    }

    /// Number-weighted density distribution `q0`, from `q3` and the
    /// diameter class means: `q0_i ∝ q3_i / d_i^3`, renormalised.
    pub fn q0(&mut self, compound: &str, t: f64, diam_means: &[f64]) -> EngineResult<Vec<f64>> {
        let q3 = self.q3(compound, t)?;
        let raw: Vec<f64> = q3.iter().zip(diam_means.iter())
            .map(|(q, d)| if *d > 0.0 { q / d.powi(3) } else { 0.0 })
            .collect();
        let total = kahan_sum(&raw);
        Ok(if total > 0.0 { raw.into_iter().map(|v| v / total).collect() } else { raw })
    }

    pub fn cumulative_q0(&mut self, compound: &str, t: f64, diam_means: &[f64]) -> EngineResult<Vec<f64>> {
        let q0 = self.q0(compound, t, diam_means)?;
        let mut acc = 0.0;
        Ok(q0.into_iter().map(|v| { acc += v; acc }).collect())
    }

    /// Area-weighted density distribution `q2`: `q2_i ∝ q3_i / d_i`.
    pub fn q2(&mut self, compound: &str, t: f64, diam_means: &[f64]) -> EngineResult<Vec<f64>> {
        let q3 = self.q3(compound, t)?;
        let raw: Vec<f64> = q3.iter().zip(diam_means.iter())
            .map(|(q, d)| if *d > 0.0 { q / d } else { 0.0 })
            .collect();
        let total = kahan_sum(&raw);
        Ok(if total > 0.0 { raw.into_iter().map(|v| v / total).collect() } else { raw })
    }

    pub fn cumulative_q2(&mut self, compound: &str, t: f64, diam_means: &[f64]) -> EngineResult<Vec<f64>> {
        let q2 = self.q2(compound, t, diam_means)?;
        let mut acc = 0.0;
        Ok(q2.into_iter().map(|v| { acc += v; acc }).collect())
    }

    /// Sauter (surface-volume mean) diameter: `d32 = 1 / sum(q3_i / d_i)`.
    pub fn sauter_diameter(&mut self, compound: &str, t: f64, diam_means: &[f64]) -> EngineResult<f64> {
        let q3 = self.q3(compound, t)?;
        let terms: Vec<f64> = q3.iter().zip(diam_means.iter())
            .map(|(q, d)| if *d > 0.0 { q / d } else { 0.0 })
            .collect();
        let denom = kahan_sum(&terms);
        if denom <= 0.0 {
            return Ok(0.0);
        }
        Ok(1.0 / denom)
    }
}
