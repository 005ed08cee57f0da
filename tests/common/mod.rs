//! Fixture units shared by the scenario tests: trivial models with known
//! closed-form behaviour, standing in for a real plug-in model library.

use flowsheet_sim::context::EngineContext;
use flowsheet_sim::error::EngineResult;
use flowsheet_sim::unit::{Holdup, ParameterManager, ParameterValue, Port, PortDirection, StreamPorts, Unit};

/// Emits a constant composition/mass/temperature/pressure on every call.
pub struct Source {
    key: String,
    ports: Vec<Port>,
    params: ParameterManager,
    holdups: Vec<Holdup>,
}

impl Source {
    pub fn new(key: &str, mass: f64, temperature: f64, pressure: f64) -> Self {
        let mut params = ParameterManager::new();
        params.declare("mass", "Mass flow", ParameterValue::Constant(mass));
        params.declare("temperature", "Temperature", ParameterValue::Constant(temperature));
        params.declare("pressure", "Pressure", ParameterValue::Constant(pressure));
        Source {
            key: key.into(),
            ports: vec![Port::new("out", "Output", PortDirection::Output)],
            params,
            holdups: Vec::new(),
        }
    }
}

impl Unit for Source {
    fn key(&self) -> &str { &self.key }
    fn ports(&self) -> &[Port] { &self.ports }
    fn ports_mut(&mut self) -> &mut [Port] { &mut self.ports }
    fn holdups(&self) -> &[Holdup] { &self.holdups }
    fn holdups_mut(&mut self) -> &mut [Holdup] { &mut self.holdups }
    fn parameters(&self) -> &ParameterManager { &self.params }
    fn parameters_mut(&mut self) -> &mut ParameterManager { &mut self.params }

    fn initialise(&mut self, _t0: f64, _ctx: &EngineContext) -> EngineResult<()> {
        self.params.lock();
        Ok(())
    }

    fn simulate(&mut self, _t1: f64, t2: f64, ports: &mut StreamPorts, _ctx: &EngineContext) -> Result<(), String> {
        let mass = self.params.constant("mass").map_err(|e| e.to_string())?;
        let temperature = self.params.constant("temperature").map_err(|e| e.to_string())?;
        let pressure = self.params.constant("pressure").map_err(|e| e.to_string())?;
        let out = ports.output("out").map_err(|e| e.to_string())?;
        let n_compounds = out.compounds().len();
        let n_phases = out.phases().len();
        out.set_mass(t2, mass).map_err(|e| e.to_string())?;
        out.set_temperature(t2, temperature).map_err(|e| e.to_string())?;
        out.set_pressure(t2, pressure).map_err(|e| e.to_string())?;
        let fractions = vec![1.0 / n_phases as f64; n_phases];
        out.set_phase_fractions(t2, &fractions).map_err(|e| e.to_string())?;
        for phase in out.phases().to_vec() {
            let comp = vec![1.0 / n_compounds as f64; n_compounds];
            out.set_phase_composition(&phase, t2, &comp).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

/// Passes its single input through to its single output unchanged.
pub struct Sink {
    key: String,
    ports: Vec<Port>,
    params: ParameterManager,
    holdups: Vec<Holdup>,
}

impl Sink {
    pub fn new(key: &str) -> Self {
        Sink {
            key: key.into(),
            ports: vec![Port::new("in", "Input", PortDirection::Input)],
            params: ParameterManager::new(),
            holdups: Vec::new(),
        }
    }
}

impl Unit for Sink {
    fn key(&self) -> &str { &self.key }
    fn ports(&self) -> &[Port] { &self.ports }
    fn ports_mut(&mut self) -> &mut [Port] { &mut self.ports }
    fn holdups(&self) -> &[Holdup] { &self.holdups }
    fn holdups_mut(&mut self) -> &mut [Holdup] { &mut self.holdups }
    fn parameters(&self) -> &ParameterManager { &self.params }
    fn parameters_mut(&mut self) -> &mut ParameterManager { &mut self.params }

    fn initialise(&mut self, _t0: f64, _ctx: &EngineContext) -> EngineResult<()> { Ok(()) }

    fn simulate(&mut self, _t1: f64, _t2: f64, _ports: &mut StreamPorts, _ctx: &EngineContext) -> Result<(), String> {
        Ok(())
    }
}

/// Combines two inputs into one output by mass-weighted mixing.
pub struct Mixer {
    key: String,
    ports: Vec<Port>,
    params: ParameterManager,
    holdups: Vec<Holdup>,
}

impl Mixer {
    pub fn new(key: &str) -> Self {
        Mixer {
            key: key.into(),
            ports: vec![
                Port::new("in1", "Input 1", PortDirection::Input),
                Port::new("in2", "Input 2", PortDirection::Input),
                Port::new("out", "Output", PortDirection::Output),
            ],
            params: ParameterManager::new(),
            holdups: Vec::new(),
        }
    }
}

impl Unit for Mixer {
    fn key(&self) -> &str { &self.key }
    fn ports(&self) -> &[Port] { &self.ports }
    fn ports_mut(&mut self) -> &mut [Port] { &mut self.ports }
    fn holdups(&self) -> &[Holdup] { &self.holdups }
    fn holdups_mut(&mut self) -> &mut [Holdup] { &mut self.holdups }
    fn parameters(&self) -> &ParameterManager { &self.params }
    fn parameters_mut(&mut self) -> &mut ParameterManager { &mut self.params }

    fn initialise(&mut self, _t0: f64, _ctx: &EngineContext) -> EngineResult<()> { Ok(()) }

    fn simulate(&mut self, _t1: f64, t2: f64, ports: &mut StreamPorts, _ctx: &EngineContext) -> Result<(), String> {
        let in1 = ports.take_input("in1").map_err(|e| e.to_string())?;
        let in2 = ports.take_input("in2").map_err(|e| e.to_string())?;
        in1.mix_with(in2, t2).map_err(|e| e.to_string())?;
        let out = ports.output("out").map_err(|e| e.to_string())?;
        out.copy_from(in1, t2, t2).map_err(|e| e.to_string())
    }
}

/// Splits its single input into two outputs by a fixed mass fraction on
/// the first output.
pub struct Splitter {
    key: String,
    ports: Vec<Port>,
    params: ParameterManager,
    holdups: Vec<Holdup>,
}

impl Splitter {
    pub fn new(key: &str, split_fraction: f64) -> Self {
        let mut params = ParameterManager::new();
        params.declare("split_fraction", "Split fraction", ParameterValue::Constant(split_fraction));
        Splitter {
            key: key.into(),
            ports: vec![
                Port::new("in", "Input", PortDirection::Input),
                Port::new("out1", "Output 1", PortDirection::Output),
                Port::new("out2", "Output 2", PortDirection::Output),
            ],
            params,
            holdups: Vec::new(),
        }
    }
}

impl Unit for Splitter {
    fn key(&self) -> &str { &self.key }
    fn ports(&self) -> &[Port] { &self.ports }
    fn ports_mut(&mut self) -> &mut [Port] { &mut self.ports }
    fn holdups(&self) -> &[Holdup] { &self.holdups }
    fn holdups_mut(&mut self) -> &mut [Holdup] { &mut self.holdups }
    fn parameters(&self) -> &ParameterManager { &self.params }
    fn parameters_mut(&mut self) -> &mut ParameterManager { &mut self.params }

    fn initialise(&mut self, _t0: f64, _ctx: &EngineContext) -> EngineResult<()> {
        self.params.lock();
        Ok(())
    }

    fn simulate(&mut self, _t1: f64, t2: f64, ports: &mut StreamPorts, _ctx: &EngineContext) -> Result<(), String> {
        let fraction = self.params.constant("split_fraction").map_err(|e| e.to_string())?;

        let (mass, temperature, pressure, fractions) = {
            let input = ports.input("in").map_err(|e| e.to_string())?;
            let mass = input.mass(t2).map_err(|e| e.to_string())?;
            let temperature = input.temperature(t2).map_err(|e| e.to_string())?;
            let pressure = input.pressure(t2).map_err(|e| e.to_string())?;
            let phases = input.phases().to_vec();
            let mut fractions = Vec::with_capacity(phases.len());
            for phase in &phases {
                fractions.push(input.phase_fraction(phase, t2).unwrap_or(0.0));
            }
            (mass, temperature, pressure, fractions)
        };

        for (port_key, share) in [("out1", fraction), ("out2", 1.0 - fraction)] {
            let out = ports.output(port_key).map_err(|e| e.to_string())?;
            out.set_mass(t2, mass * share).map_err(|e| e.to_string())?;
            out.set_temperature(t2, temperature).map_err(|e| e.to_string())?;
            out.set_pressure(t2, pressure).map_err(|e| e.to_string())?;
            out.set_phase_fractions(t2, &fractions).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
