//! Save/load of simulation state to a versioned, bincode-serialised
//! container. HDF5 interoperability with the surrounding
//! ecosystem is explicitly out of scope; this is a private format.
//!
//! Unit models are opaque trait objects (`Box<dyn Unit>`) resolved through
//! a [`crate::models_manager::ModelsManager`] at load time, not through
//! `serde`: the engine core has no way to know the concrete type behind a
//! plug-in-supplied model. A save therefore stores the *topology* (compound
//! list, phases, grid, parameters, unit keys/model ids/ports, stream
//! wiring) and leaves per-model state to be re-seeded by the caller after
//! `Load` reconstructs the flowsheet shell.

use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::grid::MultidimensionalGrid;
use crate::params::ParametersHolder;

/// Current on-disk format version. Bumped whenever a field is added,
/// removed, or reinterpreted in a way older readers could not tolerate.
pub const SAVE_VERSION: u32 = 1;

/// Oldest format version this build will still load.
pub const MIN_SUPPORTED_SAVE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPort {
    pub key: String,
    pub name: String,
    pub is_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedUnit {
    pub key: String,
    pub name: String,
    pub model_id: String,
    pub ports: Vec<SavedPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedStream {
    pub key: String,
    pub name: String,
    pub output_unit: String,
    pub output_port: String,
    pub input_unit: String,
    pub input_port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPhase {
    pub key: String,
    pub name: String,
    pub is_solid: bool,
}

/// Everything needed to reconstruct a flowsheet's shell and resume a run,
/// short of re-instantiating unit models themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveFile {
    pub version: u32,
    pub compounds: Vec<String>,
    pub phases: Vec<SavedPhase>,
    pub grid: MultidimensionalGrid,
    pub parameters: ParametersHolder,
    pub units: Vec<SavedUnit>,
    pub streams: Vec<SavedStream>,
    pub current_time: f64,
    pub current_window: f64,
}

impl SaveFile {
    pub fn write_to(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let bytes = bincode::serialize(self)?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> EngineResult<SaveFile> {
        let mut file = std::fs::File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let save: SaveFile = bincode::deserialize(&bytes)?;
        if save.version < MIN_SUPPORTED_SAVE_VERSION {
            return Err(EngineError::IOError(format!(
                "save file version {} is older than the minimum supported version {}",
                save.version, MIN_SUPPORTED_SAVE_VERSION
            )));
        }
        if save.version > SAVE_VERSION {
            return Err(EngineError::IOError(format!(
                "save file version {} is newer than this build supports ({})",
                save.version, SAVE_VERSION
            )));
        }
        Ok(save)
    }
}

/// Build a [`SaveFile`] from a flowsheet's topology and the simulator's
/// current progress. Ports/streams are described by key rather than by
/// arena index, since arena generations are not meaningful across process
/// runs.
pub fn capture(
    flowsheet: &crate::flowsheet::Flowsheet,
    parameters: &ParametersHolder,
    current_time: f64,
    current_window: f64,
    model_ids: impl Fn(&str) -> String,
) -> SaveFile {
    let phases = flowsheet.phases().iter().map(|p| SavedPhase {
        key: p.key.clone(),
        name: p.name.clone(),
        is_solid: p.state == crate::flowsheet::PhaseState::Solid,
    }).collect();

    let units = flowsheet.units.iter().map(|(_, u)| SavedUnit {
        key: u.key.clone(),
        name: u.name.clone(),
        model_id: model_ids(&u.key),
        ports: u.model.ports().iter().map(|p| SavedPort {
            key: p.key.clone(),
            name: p.name.clone(),
            is_output: p.direction == crate::unit::PortDirection::Output,
        }).collect(),
    }).collect();

    let unit_name_of = |key: crate::flowsheet::ArenaKey| -> String {
        flowsheet.units.get(key).map(|u| u.key.clone()).unwrap_or_default()
    };
    let streams = flowsheet.streams.iter().map(|(_, s)| SavedStream {
        key: s.key.clone(),
        name: s.name.clone(),
        output_unit: unit_name_of(s.output_unit),
        output_port: s.output_port.clone(),
        input_unit: unit_name_of(s.input_unit),
        input_port: s.input_port.clone(),
    }).collect();

    SaveFile {
        version: SAVE_VERSION,
        compounds: flowsheet.compounds().to_vec(),
        phases,
        grid: flowsheet.grid().clone(),
        parameters: parameters.clone(),
        units,
        streams,
        current_time,
        current_window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SaveFile {
        SaveFile {
            version: SAVE_VERSION,
            compounds: vec!["A".into(), "B".into()],
            phases: vec![SavedPhase { key: "solid".into(), name: "Solid".into(), is_solid: true }],
            grid: MultidimensionalGrid::new(),
            parameters: ParametersHolder::default(),
            units: vec![SavedUnit {
                key: "u1".into(), name: "Unit 1".into(), model_id: "Mixer".into(),
                ports: vec![SavedPort { key: "out".into(), name: "Out".into(), is_output: true }],
            }],
            streams: vec![SavedStream {
                key: "s1".into(), name: "Stream 1".into(),
                output_unit: "u1".into(), output_port: "out".into(),
                input_unit: "u2".into(), input_port: "in".into(),
            }],
            current_time: 12.5,
            current_window: 1.5,
        }
    }

    #[test]
    fn roundtrips_through_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowsheet.save");
        let save = sample();
        save.write_to(&path).unwrap();
        let loaded = SaveFile::read_from(&path).unwrap();
        assert_eq!(loaded.compounds, save.compounds);
        assert_eq!(loaded.units.len(), 1);
        assert_eq!(loaded.current_time, 12.5);
    }

    #[test]
    fn rejects_a_save_file_older_than_minimum_supported_version() {
        let mut save = sample();
        save.version = 0;
        let bytes = bincode::serialize(&save).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.save");
        std::fs::write(&path, bytes).unwrap();
        assert!(SaveFile::read_from(&path).is_err());
    }
}
