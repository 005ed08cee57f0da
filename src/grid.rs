//! Discretised axes shared by every stream and holdup: [`MultidimensionalGrid`].

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// The kind of distributed quantity a [`GridDimension`] discretises.
///
/// At most one dimension of each type may be present in a grid. The
/// `Compounds` dimension, when present, is symbolic and always mirrors the
/// flowsheet's ordered compound list; it is not user-editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionType {
    Compounds,
    Size,
    PartPorosity,
    FormFactor,
    Color,
    UserDefined(u8), // 1..=10
}

/// Function used to construct a numeric grid's boundaries from `(n, min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridFunction {
    Manual,
    Equidistant,
    GeometricInc,
    GeometricDec,
    LogarithmicInc,
    LogarithmicDec,
}

/// A basis in which particle-size-distribution class means may be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeanBasis {
    Diameter,
    Volume,
}

/// One axis of a [`MultidimensionalGrid`]: either a strictly increasing
/// sequence of numeric boundaries, or an ordered list of symbolic labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GridDimension {
    Numeric { distr_type: DistributionType, boundaries: Vec<f64> },
    Symbolic { distr_type: DistributionType, labels: Vec<String> },
}

impl GridDimension {
    pub fn distr_type(&self) -> DistributionType {
        match self {
            GridDimension::Numeric { distr_type, .. } => *distr_type,
            GridDimension::Symbolic { distr_type, .. } => *distr_type,
        }
    }

    /// Number of discretisation classes: `n` for `n+1` numeric boundaries,
    /// or the number of labels for a symbolic dimension.
    pub fn classes_number(&self) -> usize {
        match self {
            GridDimension::Numeric { boundaries, .. } => boundaries.len().saturating_sub(1),
            GridDimension::Symbolic { labels, .. } => labels.len(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, GridDimension::Numeric { .. })
    }

    /// Validate the invariant that numeric boundaries are strictly
    /// monotonically increasing and non-negative for physical axes.
    fn validate(&self) -> EngineResult<()> {
        if let GridDimension::Numeric { boundaries, .. } = self {
            if boundaries.len() < 2 {
                return Err(EngineError::StructuralError(
                    "numeric grid dimension needs at least two boundaries".into(),
                ));
            }
            for w in boundaries.windows(2) {
                if !(w[0] < w[1]) {
                    return Err(EngineError::StructuralError(
                        "grid boundaries must be strictly increasing".into(),
                    ));
                }
            }
            if boundaries[0] < 0.0 {
                return Err(EngineError::StructuralError(
                    "physical grid boundaries must be non-negative".into(),
                ));
            }
        }
        Ok(())
    }

    /// Arithmetic centres of `[b_i, b_i+1]` for a numeric dimension.
    pub fn classes_means(&self) -> Vec<f64> {
        match self {
            GridDimension::Numeric { boundaries, .. } => boundaries
                .windows(2)
                .map(|w| 0.5 * (w[0] + w[1]))
                .collect(),
            GridDimension::Symbolic { labels, .. } => vec![f64::NAN; labels.len()],
        }
    }

    /// PSD-specific class means in either the diameter or the volume basis.
    ///
    /// Volume means are `(pi/6) * d^3` of the diameter mean, not the mean of
    /// the cubed boundaries, since downstream property calculations assume
    /// the nominal-particle interpretation.
    pub fn psd_means(&self, basis: MeanBasis) -> Vec<f64> {
        let diam_means = self.classes_means();
        match basis {
            MeanBasis::Diameter => diam_means,
            MeanBasis::Volume => diam_means
                .into_iter()
                .map(|d| std::f64::consts::PI / 6.0 * d.powi(3))
                .collect(),
        }
    }

    /// Build a numeric dimension from `(n, min, max)` using `function`.
    ///
    /// `min == 0` combined with a geometric/logarithmic function is
    /// mathematically undefined (log of zero); rather than failing, a small
    /// positive floor `max * 1e-6` is substituted and the caller is told via
    /// the returned warning flag.
    pub fn build_numeric(
        distr_type: DistributionType,
        function: GridFunction,
        n: usize,
        min: f64,
        max: f64,
    ) -> EngineResult<(GridDimension, Option<String>)> {
        if n == 0 {
            return Err(EngineError::StructuralError("grid needs at least one class".into()));
        }
        if !(max > min) {
            return Err(EngineError::StructuralError("grid max must exceed min".into()));
        }
        let needs_log = matches!(
            function,
            GridFunction::GeometricInc
                | GridFunction::GeometricDec
                | GridFunction::LogarithmicInc
                | GridFunction::LogarithmicDec
        );
        let mut warning = None;
        let min = if needs_log && min <= 0.0 {
            warning = Some(format!(
                "grid minimum {min} is non-positive for a logarithmic/geometric function; \
                 substituting floor {:e}",
                max * 1e-6
            ));
            max * 1e-6
        } else {
            min
        };

        let boundaries: Vec<f64> = match function {
            GridFunction::Manual => {
                return Err(EngineError::StructuralError(
                    "MANUAL grids must be constructed from explicit boundaries".into(),
                ))
            }
            GridFunction::Equidistant => {
                let step = (max - min) / n as f64;
                (0..=n).map(|i| min + step * i as f64).collect()
            }
            GridFunction::GeometricInc => geometric(n, min, max, true),
            GridFunction::GeometricDec => geometric(n, min, max, false),
            GridFunction::LogarithmicInc => logarithmic(n, min, max, true),
            GridFunction::LogarithmicDec => logarithmic(n, min, max, false),
        };
        let dim = GridDimension::Numeric { distr_type, boundaries };
        dim.validate()?;
        Ok((dim, warning))
    }

    pub fn manual(distr_type: DistributionType, boundaries: Vec<f64>) -> EngineResult<GridDimension> {
        let dim = GridDimension::Numeric { distr_type, boundaries };
        dim.validate()?;
        Ok(dim)
    }

    pub fn symbolic(distr_type: DistributionType, labels: Vec<String>) -> GridDimension {
        GridDimension::Symbolic { distr_type, labels }
    }
}

/// Geometric spacing: constant ratio between adjacent boundaries.
/// `increasing` controls whether classes widen towards `max` or towards `min`.
fn geometric(n: usize, min: f64, max: f64, increasing: bool) -> Vec<f64> {
    let ratio = (max / min).powf(1.0 / n as f64);
    let mut raw: Vec<f64> = (0..=n).map(|i| min * ratio.powi(i as i32)).collect();
    if !increasing {
        // Mirror the spacing pattern so classes widen towards `min` instead.
        let widths: Vec<f64> = raw.windows(2).map(|w| w[1] - w[0]).rev().collect();
        raw = Vec::with_capacity(n + 1);
        raw.push(min);
        for w in widths {
            raw.push(raw.last().unwrap() + w);
        }
        raw[n] = max;
    }
    raw
}

fn logarithmic(n: usize, min: f64, max: f64, increasing: bool) -> Vec<f64> {
    let log_min = min.ln();
    let log_max = max.ln();
    let step = (log_max - log_min) / n as f64;
    let mut raw: Vec<f64> = (0..=n).map(|i| (log_min + step * i as f64).exp()).collect();
    if !increasing {
        let widths: Vec<f64> = raw.windows(2).map(|w| w[1] - w[0]).rev().collect();
        raw = Vec::with_capacity(n + 1);
        raw.push(min);
        for w in widths {
            raw.push(raw.last().unwrap() + w);
        }
        raw[n] = max;
    }
    raw
}

/// An ordered collection of [`GridDimension`]s, at most one per
/// [`DistributionType`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultidimensionalGrid {
    dimensions: Vec<GridDimension>,
}

impl MultidimensionalGrid {
    pub fn new() -> Self {
        MultidimensionalGrid { dimensions: Vec::new() }
    }

    pub fn add_dimension(&mut self, dim: GridDimension) -> EngineResult<()> {
        if self.dimensions.iter().any(|d| d.distr_type() == dim.distr_type()) {
            return Err(EngineError::StructuralError(format!(
                "grid already has a dimension of type {:?}",
                dim.distr_type()
            )));
        }
        self.dimensions.push(dim);
        Ok(())
    }

    pub fn remove_dimension(&mut self, distr_type: DistributionType) {
        self.dimensions.retain(|d| d.distr_type() != distr_type);
    }

    pub fn dimension(&self, distr_type: DistributionType) -> Option<&GridDimension> {
        self.dimensions.iter().find(|d| d.distr_type() == distr_type)
    }

    pub fn dimensions(&self) -> &[GridDimension] {
        &self.dimensions
    }

    /// Replace (or insert) the COMPOUNDS dimension to mirror the flowsheet's
    /// ordered compound list. Not user-editable otherwise.
    pub fn set_compounds(&mut self, compound_keys: Vec<String>) {
        self.remove_dimension(DistributionType::Compounds);
        self.dimensions.push(GridDimension::Symbolic {
            distr_type: DistributionType::Compounds,
            labels: compound_keys,
        });
    }

    /// Shape of the dense tensor over all declared dimensions, in
    /// declaration order.
    pub fn shape(&self) -> Vec<usize> {
        self.dimensions.iter().map(|d| d.classes_number()).collect()
    }

    /// Shape restricted to a subset of distribution types, preserving the
    /// grid's own dimension order.
    pub fn shape_subset(&self, types: &[DistributionType]) -> Vec<usize> {
        self.dimensions
            .iter()
            .filter(|d| types.contains(&d.distr_type()))
            .map(|d| d.classes_number())
            .collect()
    }

    /// Shape of the per-particle distribution tensor carried by a stream:
    /// every dimension except the symbolic COMPOUNDS axis, which is indexed
    /// separately (one distribution matrix per compound).
    pub fn shape_excluding_compounds(&self) -> Vec<usize> {
        self.dimensions
            .iter()
            .filter(|d| d.distr_type() != DistributionType::Compounds)
            .map(|d| d.classes_number())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_number_matches_boundary_count() {
        let dim = GridDimension::manual(DistributionType::Size, vec![0., 1., 2., 4.]).unwrap();
        assert_eq!(dim.classes_number(), 3);
    }

    #[test]
    fn equidistant_produces_n_plus_one_boundaries() {
        let (dim, warn) = GridDimension::build_numeric(
            DistributionType::Size, GridFunction::Equidistant, 10, 0.0, 100.0,
        ).unwrap();
        assert!(warn.is_none());
        assert_eq!(dim.classes_number(), 10);
        let means = dim.classes_means();
        assert_eq!(means.len(), 10);
        assert!((means[0] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn log_grid_with_zero_min_substitutes_floor_and_warns() {
        let (dim, warn) = GridDimension::build_numeric(
            DistributionType::Size, GridFunction::LogarithmicInc, 5, 0.0, 1000.0,
        ).unwrap();
        assert!(warn.is_some());
        if let GridDimension::Numeric { boundaries, .. } = dim {
            assert!((boundaries[0] - 1000.0 * 1e-6).abs() < 1e-12);
            assert!((boundaries.last().unwrap() - 1000.0).abs() < 1e-6);
        } else {
            panic!("expected numeric dimension");
        }
    }

    #[test]
    fn geometric_inc_boundaries_are_strictly_increasing() {
        let (dim, _) = GridDimension::build_numeric(
            DistributionType::Size, GridFunction::GeometricInc, 8, 1e-6, 1e-3,
        ).unwrap();
        if let GridDimension::Numeric { boundaries, .. } = &dim {
            for w in boundaries.windows(2) {
                assert!(w[0] < w[1]);
            }
        }
    }

    #[test]
    fn volume_mean_uses_nominal_particle_interpretation() {
        let dim = GridDimension::manual(DistributionType::Size, vec![0., 2.]).unwrap();
        let vol = dim.psd_means(MeanBasis::Volume);
        let expected = std::f64::consts::PI / 6.0 * 1.0_f64.powi(3);
        assert!((vol[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn grid_rejects_duplicate_distribution_type() {
        let mut grid = MultidimensionalGrid::new();
        grid.add_dimension(
            GridDimension::manual(DistributionType::Size, vec![0., 1.]).unwrap(),
        ).unwrap();
        let err = grid.add_dimension(
            GridDimension::manual(DistributionType::Size, vec![0., 2.]).unwrap(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn compounds_dimension_mirrors_flowsheet_list() {
        let mut grid = MultidimensionalGrid::new();
        grid.set_compounds(vec!["A".into(), "B".into(), "C".into()]);
        let dim = grid.dimension(DistributionType::Compounds).unwrap();
        assert_eq!(dim.classes_number(), 3);
    }
}
