//! The black-box unit (model) contract consumed by the engine.
//!
//! Units and accelerators are modeled as capability sets rather than a class
//! hierarchy: `Unit` is a trait object (`dyn Unit`), not a base class
//! with required overrides. A unit never sees the whole flowsheet; the
//! simulator hands it a [`StreamPorts`] view restricted to its own ports for
//! the duration of one `simulate` call.

use std::collections::HashMap;

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::stream::MaterialStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// A material-only port: no energy/signal ports in this core.
#[derive(Debug, Clone)]
pub struct Port {
    pub key: String,
    pub name: String,
    pub direction: PortDirection,
    pub stream_key: Option<String>,
}

impl Port {
    pub fn new(key: impl Into<String>, name: impl Into<String>, direction: PortDirection) -> Self {
        Port { key: key.into(), name: name.into(), direction, stream_key: None }
    }
}

/// A `MaterialStream` owned internally by a unit; persists across calls to
/// `simulate`.
pub struct Holdup {
    pub key: String,
    pub stream: MaterialStream,
}

/// One configured value of a unit parameter.
#[derive(Debug, Clone)]
pub enum ParameterValue {
    Constant(f64),
    TimeDependent(Vec<(f64, f64)>),
    Text(String),
    Checkbox(bool),
    Combo(String),
    Group(Vec<String>),
    CompoundRef(String),
    SolverRef(String),
    List(Vec<ParameterValue>),
}

/// One named unit parameter. Parameters are read-only during simulation;
/// `ParameterManager::lock` is called once simulation begins.
#[derive(Debug, Clone)]
pub struct UnitParameter {
    pub key: String,
    pub name: String,
    pub value: ParameterValue,
}

/// Holds a unit's declared parameters and enforces the read-only-during-
/// simulation rule.
#[derive(Debug, Clone, Default)]
pub struct ParameterManager {
    params: HashMap<String, UnitParameter>,
    locked: bool,
}

impl ParameterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, key: impl Into<String>, name: impl Into<String>, value: ParameterValue) {
        let key = key.into();
        self.params.insert(key.clone(), UnitParameter { key, name: name.into(), value });
    }

    pub fn get(&self, key: &str) -> EngineResult<&ParameterValue> {
        self.params.get(key).map(|p| &p.value)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown parameter '{key}'")))
    }

    pub fn set(&mut self, key: &str, value: ParameterValue) -> EngineResult<()> {
        if self.locked {
            return Err(EngineError::InvalidTarget(format!(
                "parameter '{key}' cannot be changed while the simulation is running"
            )));
        }
        let p = self.params.get_mut(key)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown parameter '{key}'")))?;
        p.value = value;
        Ok(())
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn constant(&self, key: &str) -> EngineResult<f64> {
        match self.get(key)? {
            ParameterValue::Constant(v) => Ok(*v),
            _ => Err(EngineError::InvalidTarget(format!("parameter '{key}' is not a constant"))),
        }
    }
}

/// A view restricted to one unit's connected streams, handed to it for the
/// duration of a `simulate` call.
pub struct StreamPorts<'a> {
    pub inputs: HashMap<String, &'a mut MaterialStream>,
    pub outputs: HashMap<String, &'a mut MaterialStream>,
}

impl<'a> StreamPorts<'a> {
    pub fn input(&mut self, port_key: &str) -> EngineResult<&mut MaterialStream> {
        self.inputs.get_mut(port_key).map(|s| &mut **s)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown input port '{port_key}'")))
    }

    /// Remove an input stream from this view and hand back ownership of its
    /// reference, independent of any further borrow of `self`. Needed when
    /// a unit must hold two input streams mutably at once (e.g. mixing one
    /// into another), which `input` cannot express since it reborrows from
    /// `self` as a whole.
    pub fn take_input(&mut self, port_key: &str) -> EngineResult<&'a mut MaterialStream> {
        self.inputs.remove(port_key)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown input port '{port_key}'")))
    }

    pub fn output(&mut self, port_key: &str) -> EngineResult<&mut MaterialStream> {
        self.outputs.get_mut(port_key).map(|s| &mut **s)
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown output port '{port_key}'")))
    }
}

/// The contract every unit model implements.
///
/// `simulate` must be idempotent with respect to its inputs: calling it
/// again with the same input streams over the same interval must yield the
/// same output streams, at least within tolerance. Steady-state units
/// may ignore `t1` and treat `t2` as the instant being evaluated.
pub trait Unit {
    fn key(&self) -> &str;

    fn ports(&self) -> &[Port];
    fn ports_mut(&mut self) -> &mut [Port];

    fn holdups(&self) -> &[Holdup];
    fn holdups_mut(&mut self) -> &mut [Holdup];

    fn parameters(&self) -> &ParameterManager;
    fn parameters_mut(&mut self) -> &mut ParameterManager;

    /// Prepare internal state for time `t0`. Called exactly once per
    /// simulation per unit, before any `simulate` call.
    fn initialise(&mut self, t0: f64, ctx: &EngineContext) -> EngineResult<()>;

    /// Read input streams over `[t1, t2]`, write output streams and internal
    /// holdups over the same interval. A non-empty error aborts the run
    /// (surfaced by the simulator as `EngineError::UnitError`).
    fn simulate(&mut self, t1: f64, t2: f64, ports: &mut StreamPorts, ctx: &EngineContext) -> Result<(), String>;

    /// Release transient resources.
    fn finalise(&mut self) -> EngineResult<()> {
        Ok(())
    }

    /// Whether this unit's output streams carry meaningful particle-size
    /// distributions. Units that do (crushers, screens, granulators, ...)
    /// override this so `Flowsheet::initialise` can require a solid-phase
    /// grid dimension; units that only move scalars (mixers, sources, ...)
    /// use the default.
    fn produces_psd(&self) -> bool {
        false
    }
}
