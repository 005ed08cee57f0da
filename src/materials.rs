//! Minimal interface onto the materials-properties database.
//!
//! The database file parser and the correlation evaluator are explicit
//! out-of-scope collaborators; the engine only needs read-only lookup of a
//! compound's constants and temperature/pressure-dependent correlations.

/// Constants and correlations exposed for one compound.
pub trait CompoundProperties {
    fn key(&self) -> &str;
    /// Scalar constant lookup (e.g. molar mass, critical temperature).
    fn constant(&self, name: &str) -> Option<f64>;
    /// Evaluate a temperature/pressure-dependent correlation (e.g. heat
    /// capacity, density) at `(t, p)`.
    fn correlation(&self, name: &str, t: f64, p: f64) -> Option<f64>;
}

/// Read-only compound lookup. Implemented by the (out-of-scope) materials
/// database loader; the engine only ever calls `get_compound`.
pub trait MaterialsDatabase {
    fn get_compound(&self, key: &str) -> Option<&dyn CompoundProperties>;
}

/// Trivial in-memory database sufficient for engine-level tests that do not
/// exercise real physical correlations.
#[derive(Default)]
pub struct InMemoryCompound {
    pub key: String,
    pub constants: std::collections::HashMap<String, f64>,
}

impl CompoundProperties for InMemoryCompound {
    fn key(&self) -> &str {
        &self.key
    }

    fn constant(&self, name: &str) -> Option<f64> {
        self.constants.get(name).copied()
    }

    fn correlation(&self, _name: &str, _t: f64, _p: f64) -> Option<f64> {
        None
    }
}

#[derive(Default)]
pub struct InMemoryMaterialsDatabase {
    compounds: std::collections::HashMap<String, InMemoryCompound>,
}

impl InMemoryMaterialsDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, compound: InMemoryCompound) {
        self.compounds.insert(compound.key.clone(), compound);
    }
}

impl MaterialsDatabase for InMemoryMaterialsDatabase {
    fn get_compound(&self, key: &str) -> Option<&dyn CompoundProperties> {
        self.compounds.get(key).map(|c| c as &dyn CompoundProperties)
    }
}
