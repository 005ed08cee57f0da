//! Minimal interface onto the plug-in unit/solver loader.
//!
//! The dynamic-library ABI and the plug-in discovery mechanism are explicit
//! out-of-scope collaborators. The engine only ever holds an opaque handle
//! and calls the [`crate::unit::Unit`] contract on it; it never deserialises
//! model ABI itself.

use crate::error::{EngineError, EngineResult};
use crate::unit::Unit;

/// Instantiates units (and, in a fuller build, solvers) by a stable,
/// registry-assigned key.
pub trait ModelsManager {
    fn instantiate_unit(&self, unique_id: &str) -> EngineResult<Box<dyn Unit>>;
}

/// A models manager backed by a fixed set of constructor functions,
/// sufficient for tests that wire up fixture units without a real plug-in
/// loader.
#[derive(Default)]
pub struct StaticModelsManager {
    factories: std::collections::HashMap<String, Box<dyn Fn() -> Box<dyn Unit> + Send + Sync>>,
}

impl StaticModelsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        unique_id: impl Into<String>,
        factory: impl Fn() -> Box<dyn Unit> + Send + Sync + 'static,
    ) {
        self.factories.insert(unique_id.into(), Box::new(factory));
    }
}

impl ModelsManager for StaticModelsManager {
    fn instantiate_unit(&self, unique_id: &str) -> EngineResult<Box<dyn Unit>> {
        self.factories.get(unique_id)
            .map(|f| f())
            .ok_or_else(|| EngineError::ModelLoadError(format!("unknown model id '{unique_id}'")))
    }
}
