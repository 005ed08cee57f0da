//! Round-trips a flowsheet's topology through `persistence::capture` and
//! back, confirming a loaded save describes the same units, streams, and
//! simulation progress as the flowsheet it was taken from.

mod common;

use common::{Mixer, Sink, Source};
use flowsheet_sim::flowsheet::{Flowsheet, PhaseState};
use flowsheet_sim::params::ParametersHolder;
use flowsheet_sim::persistence::{self, SaveFile};

fn build_flowsheet() -> Flowsheet {
    let mut fs = Flowsheet::new();
    fs.add_compound("Water");
    fs.add_compound("Sand");
    fs.add_phase("solid", "Solid", PhaseState::Solid);
    fs.add_phase("liquid", "Liquid", PhaseState::Liquid);

    fs.add_unit("src1", "Source 1", Box::new(Source::new("src1", 1.0, 300.0, 1e5))).unwrap();
    fs.add_unit("src2", "Source 2", Box::new(Source::new("src2", 2.0, 350.0, 1e5))).unwrap();
    fs.add_unit("mix", "Mixer", Box::new(Mixer::new("mix"))).unwrap();
    fs.add_unit("sink", "Sink", Box::new(Sink::new("sink"))).unwrap();

    fs.add_stream("s1", "S1", "src1", "out", "mix", "in1", usize::MAX, None).unwrap();
    fs.add_stream("s2", "S2", "src2", "out", "mix", "in2", usize::MAX, None).unwrap();
    fs.add_stream("s3", "S3", "mix", "out", "sink", "in", usize::MAX, None).unwrap();

    fs
}

fn model_id_of(unit_key: &str) -> String {
    match unit_key {
        "src1" | "src2" => "Source".into(),
        "mix" => "Mixer".into(),
        "sink" => "Sink".into(),
        other => other.into(),
    }
}

#[test]
fn capture_and_reload_preserve_topology_and_progress() {
    let fs = build_flowsheet();
    let params = ParametersHolder::default();
    let save = persistence::capture(&fs, &params, 12.5, 2.0, model_id_of);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowsheet.save");
    save.write_to(&path).unwrap();
    let loaded = SaveFile::read_from(&path).unwrap();

    assert_eq!(loaded.compounds, vec!["Water".to_string(), "Sand".to_string()]);
    assert_eq!(loaded.phases.len(), 2);
    assert_eq!(loaded.units.len(), 4);
    assert_eq!(loaded.streams.len(), 3);
    assert_eq!(loaded.current_time, 12.5);
    assert_eq!(loaded.current_window, 2.0);

    let mixer = loaded.units.iter().find(|u| u.key == "mix").unwrap();
    assert_eq!(mixer.model_id, "Mixer");
    assert_eq!(mixer.ports.len(), 3);

    let recycle_free = loaded.streams.iter().find(|s| s.key == "s3").unwrap();
    assert_eq!(recycle_free.output_unit, "mix");
    assert_eq!(recycle_free.input_unit, "sink");
}
