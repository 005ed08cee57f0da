//! The static flowsheet graph: units, streams, compounds, phases, grid,
//! parameters.
//!
//! Cyclic references (streams pointing back to their owning flowsheet, units
//! to parameter managers) are avoided by using slotted arenas keyed by
//! opaque, generation-tagged indices rather than pointers. A
//! user-facing persistent string key is layered on top for lookups that
//! survive save/load.

use std::collections::HashMap;

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::grid::MultidimensionalGrid;
use crate::params::ParametersHolder;
use crate::stream::MaterialStream;
use crate::unit::Unit;

/// Stable key into an [`Arena`], generation-tagged to invalidate once its
/// slot is removed and reused.
pub type ArenaKey = generational_arena::Index;

/// A generational arena: stable keys across removal/reinsertion, no pointer
/// back-references required.
pub type Arena<T> = generational_arena::Arena<T>;

/// One declared phase (state + display name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseState {
    Solid,
    Liquid,
    Vapour,
}

#[derive(Debug, Clone)]
pub struct PhaseDescriptor {
    pub key: String,
    pub name: String,
    pub state: PhaseState,
}

/// A unit together with its model instance.
pub struct UnitEntry {
    pub key: String,
    pub name: String,
    pub model: Box<dyn Unit>,
    /// Unit-local grid, if it differs from the flowsheet's main grid.
    pub own_grid: Option<MultidimensionalGrid>,
}

/// A stream connecting exactly one output port to exactly one input port.
/// The "input side" instance is only materialised when the connected unit's
/// grid differs from the flowsheet's main grid.
pub struct StreamEntry {
    pub key: String,
    pub name: String,
    pub output_unit: ArenaKey,
    pub output_port: String,
    pub input_unit: ArenaKey,
    pub input_port: String,
    pub main: MaterialStream,
    pub input_side: Option<MaterialStream>,
    pub is_tear: bool,
}

impl StreamEntry {
    /// The stream instance a unit should read from its input port: the main
    /// stream when no grid conversion is needed, otherwise the distinct,
    /// rebinned input-side instance.
    pub fn input_view(&mut self) -> &mut MaterialStream {
        self.input_side.as_mut().unwrap_or(&mut self.main)
    }
}

/// Owns the canonical lists of units, streams, compounds, phases, the main
/// grid, and the parameter holder.
pub struct Flowsheet {
    pub units: Arena<UnitEntry>,
    pub streams: Arena<StreamEntry>,
    unit_keys: HashMap<String, ArenaKey>,
    stream_keys: HashMap<String, ArenaKey>,
    compounds: Vec<String>,
    phases: Vec<PhaseDescriptor>,
    grid: MultidimensionalGrid,
    pub parameters: ParametersHolder,
    pub topology_dirty: bool,
}

impl Default for Flowsheet {
    fn default() -> Self {
        Self::new()
    }
}

impl Flowsheet {
    pub fn new() -> Self {
        Flowsheet {
            units: Arena::new(),
            streams: Arena::new(),
            unit_keys: HashMap::new(),
            stream_keys: HashMap::new(),
            compounds: Vec::new(),
            phases: Vec::new(),
            grid: MultidimensionalGrid::new(),
            parameters: ParametersHolder::default(),
            topology_dirty: true,
        }
    }

    // -- Compounds / phases / grid --

    pub fn add_compound(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.compounds.contains(&key) {
            self.compounds.push(key);
            self.grid.set_compounds(self.compounds.clone());
        }
    }

    pub fn compounds(&self) -> &[String] {
        &self.compounds
    }

    pub fn add_phase(&mut self, key: impl Into<String>, name: impl Into<String>, state: PhaseState) {
        self.phases.push(PhaseDescriptor { key: key.into(), name: name.into(), state });
    }

    pub fn phases(&self) -> &[PhaseDescriptor] {
        &self.phases
    }

    pub fn solid_phase_key(&self) -> Option<&str> {
        self.phases.iter().find(|p| p.state == PhaseState::Solid).map(|p| p.key.as_str())
    }

    pub fn grid(&self) -> &MultidimensionalGrid {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut MultidimensionalGrid {
        &mut self.grid
    }

    // -- Units --

    pub fn add_unit(&mut self, key: impl Into<String>, name: impl Into<String>, model: Box<dyn Unit>) -> EngineResult<ArenaKey> {
        let key = key.into();
        if self.unit_keys.contains_key(&key) {
            return Err(EngineError::StructuralError(format!("duplicate unit key '{key}'")));
        }
        let arena_key = self.units.insert(UnitEntry { key: key.clone(), name: name.into(), model, own_grid: None });
        self.unit_keys.insert(key, arena_key);
        self.topology_dirty = true;
        Ok(arena_key)
    }

    pub fn unit_key_to_arena(&self, key: &str) -> EngineResult<ArenaKey> {
        self.unit_keys.get(key).copied()
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown unit '{key}'")))
    }

    pub fn remove_unit(&mut self, key: &str) -> EngineResult<()> {
        let arena_key = self.unit_key_to_arena(key)?;
        self.units.remove(arena_key);
        self.unit_keys.remove(key);
        self.topology_dirty = true;
        Ok(())
    }

    // -- Streams --

    pub fn add_stream(
        &mut self,
        key: impl Into<String>,
        name: impl Into<String>,
        output_unit: &str,
        output_port: &str,
        input_unit: &str,
        input_port: &str,
        cache_window: usize,
        cache_dir: Option<std::path::PathBuf>,
    ) -> EngineResult<ArenaKey> {
        let key = key.into();
        if self.stream_keys.contains_key(&key) {
            return Err(EngineError::StructuralError(format!("duplicate stream key '{key}'")));
        }
        let out_key = self.unit_key_to_arena(output_unit)?;
        let in_key = self.unit_key_to_arena(input_unit)?;
        if out_key == in_key && output_port == input_port {
            return Err(EngineError::StructuralError("a port cannot connect to itself".into()));
        }
        for (_, existing) in self.streams.iter() {
            if existing.output_unit == out_key && existing.output_port == output_port {
                return Err(EngineError::StructuralError(format!(
                    "output port '{output_port}' of unit '{output_unit}' is already claimed by stream '{}'",
                    existing.key
                )));
            }
            if existing.input_unit == in_key && existing.input_port == input_port {
                return Err(EngineError::StructuralError(format!(
                    "input port '{input_port}' of unit '{input_unit}' is already claimed by stream '{}'",
                    existing.key
                )));
            }
        }
        let dist_shape = self.grid.shape_excluding_compounds();
        let solid_phase = self.solid_phase_key().unwrap_or("solid").to_string();
        let phase_keys: Vec<String> = self.phases.iter().map(|p| p.key.clone()).collect();
        let stream = MaterialStream::new(
            key.clone(), self.compounds.clone(), phase_keys, solid_phase, dist_shape, cache_window, cache_dir,
        );
        let entry = StreamEntry {
            key: key.clone(),
            name: name.into(),
            output_unit: out_key,
            output_port: output_port.to_string(),
            input_unit: in_key,
            input_port: input_port.to_string(),
            main: stream,
            input_side: None,
            is_tear: false,
        };
        let arena_key = self.streams.insert(entry);
        self.stream_keys.insert(key, arena_key);
        self.topology_dirty = true;
        Ok(arena_key)
    }

    pub fn stream_key_to_arena(&self, key: &str) -> EngineResult<ArenaKey> {
        self.stream_keys.get(key).copied()
            .ok_or_else(|| EngineError::InvalidTarget(format!("unknown stream '{key}'")))
    }

    pub fn remove_stream(&mut self, key: &str) -> EngineResult<()> {
        let arena_key = self.stream_key_to_arena(key)?;
        self.streams.remove(arena_key);
        self.stream_keys.remove(key);
        self.topology_dirty = true;
        Ok(())
    }

    /// Assign a unit-local grid that differs from the flowsheet's main grid,
    /// triggering input-side stream materialisation and rebinning.
    pub fn set_unit_grid(&mut self, unit_key: &str, grid: MultidimensionalGrid) -> EngineResult<()> {
        let arena_key = self.unit_key_to_arena(unit_key)?;
        let unit = self.units.get_mut(arena_key).unwrap();
        unit.own_grid = Some(grid);
        Ok(())
    }

    /// Materialise or refresh the distinct input-side stream instance for
    /// every stream whose consuming unit declares its own grid.
    fn materialise_input_sides(&mut self, cache_window: usize, cache_dir: Option<std::path::PathBuf>) {
        let unit_grids: HashMap<ArenaKey, MultidimensionalGrid> = self.units.iter()
            .filter_map(|(k, u)| u.own_grid.clone().map(|g| (k, g)))
            .collect();
        for (_, stream) in self.streams.iter_mut() {
            if let Some(own_grid) = unit_grids.get(&stream.input_unit) {
                if own_grid.shape() != self.grid.shape() && stream.input_side.is_none() {
                    let dist_shape = own_grid.shape_excluding_compounds();
                    let solid_phase = self.phases.iter().find(|p| p.state == PhaseState::Solid)
                        .map(|p| p.key.clone()).unwrap_or_else(|| "solid".into());
                    let phase_keys: Vec<String> = self.phases.iter().map(|p| p.key.clone()).collect();
                    stream.input_side = Some(MaterialStream::new(
                        format!("{}__input", stream.key), self.compounds.clone(), phase_keys,
                        solid_phase, dist_shape, cache_window, cache_dir.clone(),
                    ));
                }
            }
        }
    }

    /// Checks structural validity, propagates compounds/phases/grid, and
    /// materialises input-side streams for unit-local grid conversion.
    /// Returns a descriptive error on any failure; the simulator
    /// treats any error as fatal.
    pub fn initialise(&mut self, ctx: &EngineContext) -> EngineResult<()> {
        if self.compounds.is_empty() {
            return Err(EngineError::StructuralError("flowsheet has no compounds".into()));
        }
        if self.phases.is_empty() {
            return Err(EngineError::StructuralError("flowsheet has no phases".into()));
        }
        let any_unit_produces_psd = self.units.iter().any(|(_, u)| u.model.produces_psd());
        if any_unit_produces_psd && self.grid.shape_excluding_compounds().is_empty() {
            return Err(EngineError::StructuralError(
                "a unit produces particle-size distributions but the grid has no solid-phase dimension (e.g. size) to carry them".into(),
            ));
        }
        // Every port must be connected to exactly one stream.
        let mut connected: HashMap<(ArenaKey, String, bool), bool> = HashMap::new();
        for (_, stream) in self.streams.iter() {
            connected.insert((stream.output_unit, stream.output_port.clone(), true), true);
            connected.insert((stream.input_unit, stream.input_port.clone(), false), true);
        }
        for (unit_key, unit) in self.units.iter() {
            for port in unit.model.ports() {
                use crate::unit::PortDirection;
                let is_output = port.direction == PortDirection::Output;
                if !connected.contains_key(&(unit_key, port.key.clone(), is_output)) {
                    return Err(EngineError::StructuralError(format!(
                        "port '{}' of unit '{}' is not connected", port.key, unit.key
                    )));
                }
            }
        }
        let cache_window = self.parameters.cache_window;
        let cache_dir = self.parameters.cache_path.clone();
        self.materialise_input_sides(cache_window, cache_dir);
        ctx.info(&crate::context::LogContext::default(), "flowsheet initialised");
        Ok(())
    }

    /// Discard all stream data strictly after `t1`, across every stream in
    /// the flowsheet. Used to roll a window back to its starting point when
    /// a partition diverges and the window is retried at half size.
    pub fn rollback_after(&mut self, t1: f64) {
        for (_, stream) in self.streams.iter_mut() {
            stream.main.remove_time_points_strictly_after(t1);
            if let Some(input_side) = stream.input_side.as_mut() {
                input_side.remove_time_points_strictly_after(t1);
            }
        }
    }

    /// Copy output-side stream data into a unit's input-side instance for
    /// `[t1, t2]`, rebinning along any axis whose boundaries differ.
    pub fn prepare_input_streams(&mut self, unit_key: ArenaKey, t1: f64, t2: f64) -> EngineResult<()> {
        let stream_keys: Vec<ArenaKey> = self.streams.iter()
            .filter(|(_, s)| s.input_unit == unit_key && s.input_side.is_some())
            .map(|(k, _)| k)
            .collect();
        for key in stream_keys {
            let entry = self.streams.get_mut(key).unwrap();
            let StreamEntry { main, input_side, .. } = entry;
            input_side.as_mut().unwrap().copy_from(main, t1, t2)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Holdup as UnitHoldup, ParameterManager, Port, PortDirection, StreamPorts, Unit as UnitTrait};

    struct NullUnit {
        key: String,
        ports: Vec<Port>,
        params: ParameterManager,
        holdups: Vec<UnitHoldup>,
    }

    impl UnitTrait for NullUnit {
        fn key(&self) -> &str { &self.key }
        fn ports(&self) -> &[Port] { &self.ports }
        fn ports_mut(&mut self) -> &mut [Port] { &mut self.ports }
        fn holdups(&self) -> &[UnitHoldup] { &self.holdups }
        fn holdups_mut(&mut self) -> &mut [UnitHoldup] { &mut self.holdups }
        fn parameters(&self) -> &ParameterManager { &self.params }
        fn parameters_mut(&mut self) -> &mut ParameterManager { &mut self.params }
        fn initialise(&mut self, _t0: f64, _ctx: &EngineContext) -> EngineResult<()> { Ok(()) }
        fn simulate(&mut self, _t1: f64, _t2: f64, _ports: &mut StreamPorts, _ctx: &EngineContext) -> Result<(), String> { Ok(()) }
    }

    fn unit(key: &str, out: bool, inp: bool) -> Box<dyn UnitTrait> {
        let mut ports = Vec::new();
        if out { ports.push(Port::new("out", "Out", PortDirection::Output)); }
        if inp { ports.push(Port::new("in", "In", PortDirection::Input)); }
        Box::new(NullUnit { key: key.into(), ports, params: ParameterManager::new(), holdups: Vec::new() })
    }

    #[test]
    fn arena_reuses_slots_with_new_generation() {
        let mut arena: Arena<i32> = Arena::new();
        let k1 = arena.insert(1);
        arena.remove(k1);
        let k2 = arena.insert(2);
        let (i1, g1) = k1.into_raw_parts();
        let (i2, g2) = k2.into_raw_parts();
        assert_eq!(i1, i2);
        assert_ne!(g1, g2);
        assert!(arena.get(k1).is_none());
        assert_eq!(*arena.get(k2).unwrap(), 2);
    }

    #[test]
    fn initialise_fails_with_no_compounds() {
        let mut fs = Flowsheet::new();
        fs.add_phase("solid", "Solid", PhaseState::Solid);
        let ctx = EngineContext::with_threads(1);
        assert!(fs.initialise(&ctx).is_err());
    }

    #[test]
    fn initialise_fails_on_unconnected_port() {
        let mut fs = Flowsheet::new();
        fs.add_compound("A");
        fs.add_phase("solid", "Solid", PhaseState::Solid);
        fs.add_unit("u1", "Unit 1", unit("u1", true, false)).unwrap();
        let ctx = EngineContext::with_threads(1);
        assert!(fs.initialise(&ctx).is_err());
    }

    #[test]
    fn initialise_succeeds_when_all_ports_connected() {
        let mut fs = Flowsheet::new();
        fs.add_compound("A");
        fs.add_phase("solid", "Solid", PhaseState::Solid);
        fs.add_unit("u1", "Unit 1", unit("u1", true, false)).unwrap();
        fs.add_unit("u2", "Unit 2", unit("u2", false, true)).unwrap();
        fs.add_stream("s1", "Stream 1", "u1", "out", "u2", "in", usize::MAX, None).unwrap();
        let ctx = EngineContext::with_threads(1);
        fs.initialise(&ctx).unwrap();
    }
}
