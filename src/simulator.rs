//! The waveform-relaxation orchestrator: advances the flowsheet through
//! time windows, iterating each strongly connected partition to
//! convergence before moving on.

use std::collections::HashMap;

use crate::accelerator::AcceleratorState;
use crate::context::{EngineContext, LogContext};
use crate::error::{EngineError, EngineResult};
use crate::extrapolate::extrapolate;
use crate::flowsheet::{ArenaKey, Flowsheet};
use crate::params::ParametersHolder;
use crate::sequence::{CalculationSequence, Partition};
use crate::unit::StreamPorts;

/// History of a tear stream's converged flattened state (overall scalars,
/// phase fractions, phase compositions, solid distributions — see
/// [`MaterialStream::tear_vector`]) across past windows, used to extrapolate
/// the next window's initial guess. Capped to the last three windows, the
/// most any extrapolation method needs.
#[derive(Debug, Clone, Default)]
struct TearHistory {
    times: Vec<f64>,
    snapshots: Vec<Vec<f64>>,
}

impl TearHistory {
    fn push(&mut self, t: f64, values: Vec<f64>) {
        self.times.push(t);
        self.snapshots.push(values);
        if self.times.len() > 3 {
            self.times.remove(0);
            self.snapshots.remove(0);
        }
    }
}

/// Orchestrates a flowsheet through time using waveform relaxation.
pub struct Simulator {
    flowsheet: Flowsheet,
    sequence: CalculationSequence,
    parameters: ParametersHolder,
    time: f64,
    window: f64,
    window_index: usize,
    tear_history: HashMap<ArenaKey, TearHistory>,
}

impl Simulator {
    pub fn new(flowsheet: Flowsheet, parameters: ParametersHolder) -> Self {
        let window = parameters.init_time_window;
        Simulator {
            flowsheet,
            sequence: CalculationSequence::default(),
            parameters,
            time: 0.0,
            window,
            window_index: 0,
            tear_history: HashMap::new(),
        }
    }

    pub fn flowsheet(&self) -> &Flowsheet {
        &self.flowsheet
    }

    pub fn flowsheet_mut(&mut self) -> &mut Flowsheet {
        &mut self.flowsheet
    }

    pub fn current_time(&self) -> f64 {
        self.time
    }

    /// Validate the flowsheet, derive its calculation sequence, and call
    /// `initialise` on every unit. Must be called before the first `step`.
    pub fn initialise(&mut self, ctx: &EngineContext) -> EngineResult<()> {
        self.flowsheet.initialise(ctx)?;
        self.sequence = CalculationSequence::analyse(&self.flowsheet)?;
        for (_, unit) in self.flowsheet.units.iter_mut() {
            unit.model.initialise(self.time, ctx)
                .map_err(|_| EngineError::UnitError { unit: unit.key.clone(), message: "initialise failed".into() })?;
        }
        self.time = 0.0;
        self.window = self.parameters.init_time_window;
        Ok(())
    }

    /// Run to `end_simulation_time`, cooperatively checking cancellation
    /// between windows and between partitions.
    pub fn run(&mut self, ctx: &EngineContext) -> EngineResult<()> {
        while self.time < self.parameters.end_simulation_time {
            if ctx.is_cancelled() {
                return Err(EngineError::UserAborted);
            }
            self.step(ctx)?;
        }
        Ok(())
    }

    /// Advance by exactly one time window, adapting its length based on how
    /// the previous window converged. The single-window boundary
    /// is the unit of cooperative cancellation: a run can be stopped
    /// between calls without leaving a partially-simulated window behind.
    ///
    /// On `PartitionDiverged`, the window is rolled back (every stream
    /// truncated to its state at `t1`), the window length is halved, and the
    /// whole window is retried, up to `max_iter` retries in total.
    pub fn step(&mut self, ctx: &EngineContext) -> EngineResult<()> {
        let t1 = self.time;
        let mut window = self.window;
        let mut retries = 0u32;

        loop {
            let mut t2 = (t1 + window).min(self.parameters.end_simulation_time);
            if t2 <= t1 {
                t2 = self.parameters.end_simulation_time;
            }

            let partitions = self.sequence.partitions.clone();
            let mut max_iterations_used = 0u32;
            let mut diverged = None;
            for (partition_idx, partition) in partitions.iter().enumerate() {
                if ctx.is_cancelled() {
                    return Err(EngineError::UserAborted);
                }
                match self.simulate_partition(partition_idx, partition, t1, t2, ctx) {
                    Ok(iters) => max_iterations_used = max_iterations_used.max(iters),
                    Err(EngineError::PartitionDiverged { partition, iterations }) => {
                        diverged = Some((partition, iterations));
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some((partition, iterations)) = diverged {
                retries += 1;
                if retries > self.parameters.max_iter {
                    return Err(EngineError::PartitionDiverged { partition, iterations });
                }
                ctx.warn(&LogContext::partition(partition, self.window_index),
                    &format!("window diverged, rolling back and halving window (retry {retries})"));
                self.flowsheet.rollback_after(t1);
                window /= 2.0;
                if window < self.parameters.min_time_window {
                    return Err(EngineError::MinWindowReached { min_window: self.parameters.min_time_window });
                }
                continue;
            }

            self.window = window;
            self.adapt_window(max_iterations_used)?;
            self.time = t2;
            self.window_index += 1;
            return Ok(());
        }
    }

    fn adapt_window(&mut self, iterations_used: u32) -> EngineResult<()> {
        let upper_limit = if self.window_index == 0 {
            self.parameters.iters_1st_upper_limit
        } else {
            self.parameters.iters_upper_limit
        };
        if iterations_used <= self.parameters.iters_lower_limit {
            self.window = (self.window * self.parameters.magnification_ratio).min(self.parameters.max_time_window);
        } else if iterations_used >= upper_limit {
            self.window /= self.parameters.magnification_ratio;
            if self.window < self.parameters.min_time_window {
                return Err(EngineError::MinWindowReached { min_window: self.parameters.min_time_window });
            }
        }
        Ok(())
    }

    /// Simulate one partition over `[t1, t2]`, returning the number of
    /// relaxation iterations it took (1 for a trivial, acyclic partition).
    fn simulate_partition(
        &mut self,
        partition_idx: usize,
        partition: &Partition,
        t1: f64,
        t2: f64,
        ctx: &EngineContext,
    ) -> EngineResult<u32> {
        if partition.is_trivial() {
            let unit_key = partition.units[0];
            self.simulate_unit(unit_key, t1, t2, ctx)?;
            return Ok(1);
        }

        let guess = self.initial_guess(partition, t1, t2);
        let mut current = guess;
        let mut accel = AcceleratorState::new();
        accel.reset_for_window();

        let upper_limit = if self.window_index == 0 {
            self.parameters.iters_1st_upper_limit
        } else {
            self.parameters.max_iter
        };

        for iteration in 1..=upper_limit {
            if ctx.is_cancelled() {
                return Err(EngineError::UserAborted);
            }
            self.apply_tear_guess(partition, t2, &current);
            for &unit_key in &partition.units {
                self.simulate_unit(unit_key, t1, t2, ctx)?;
            }
            let computed = self.read_tear_values(partition, t2);

            let converged = current.iter().zip(&computed).all(|(g, c)| {
                let tol = self.parameters.abs_tol + self.parameters.rel_tol * c.abs().max(g.abs());
                (c - g).abs() <= tol
            });

            if converged {
                self.commit_tear_history(partition, t2, &computed);
                ctx.debug(&LogContext::partition(partition_idx, self.window_index),
                    &format!("partition converged in {iteration} iterations"));
                return Ok(iteration);
            }

            current = accel.accelerate(
                self.parameters.convergence_method,
                self.parameters.relaxation_param,
                self.parameters.wegstein_accel,
                &current,
                &computed,
            );
        }

        ctx.error(&LogContext::partition(partition_idx, self.window_index), "partition failed to converge");
        Err(EngineError::PartitionDiverged { partition: partition_idx, iterations: upper_limit })
    }

    fn simulate_unit(&mut self, unit_key: ArenaKey, t1: f64, t2: f64, ctx: &EngineContext) -> EngineResult<()> {
        use crate::unit::PortDirection;

        self.flowsheet.prepare_input_streams(unit_key, t1, t2)?;

        let Flowsheet { units, streams, .. } = &mut self.flowsheet;
        let unit_entry = units.get_mut(unit_key)
            .ok_or_else(|| EngineError::StructuralError("unit vanished mid-simulation".into()))?;
        let unit_name = unit_entry.key.clone();

        let input_ports: Vec<String> = unit_entry.model.ports().iter()
            .filter(|p| p.direction == PortDirection::Input).map(|p| p.key.clone()).collect();
        let output_ports: Vec<String> = unit_entry.model.ports().iter()
            .filter(|p| p.direction == PortDirection::Output).map(|p| p.key.clone()).collect();

        let mut inputs = HashMap::new();
        let mut outputs = HashMap::new();
        for (_, stream) in streams.iter_mut() {
            if stream.input_unit == unit_key && input_ports.contains(&stream.input_port) {
                inputs.insert(stream.input_port.clone(), stream.input_view());
            } else if stream.output_unit == unit_key && output_ports.contains(&stream.output_port) {
                outputs.insert(stream.output_port.clone(), &mut stream.main);
            }
        }

        let mut ports = StreamPorts { inputs, outputs };
        unit_entry.model.simulate(t1, t2, &mut ports, ctx)
            .map_err(|message| EngineError::UnitError { unit: unit_name, message })
    }

    /// Build the initial tear-stream guess for a new window, one full
    /// flattened [`MaterialStream::tear_vector`] per tear stream,
    /// concatenated in partition order.
    ///
    /// Extrapolated from the last (up to three) converged windows' history
    /// when any exists. With no history yet: on the very first window, if
    /// `initialize_tear_streams_auto` is off, whatever the caller already
    /// set on the tear stream at `t1` is used as-is (user-provided initial
    /// values); otherwise a neutral default guess is used.
    fn initial_guess(&mut self, partition: &Partition, t1: f64, t_new: f64) -> Vec<f64> {
        let mut guess = Vec::new();
        for &stream_key in &partition.tear_streams {
            let history = self.tear_history.get(&stream_key).cloned().unwrap_or_default();
            let Some(stream) = self.flowsheet.streams.get_mut(stream_key) else { continue };
            if !history.times.is_empty() {
                let len = stream.main.tear_vector_len();
                for comp_idx in 0..len {
                    let series: Vec<f64> = history.snapshots.iter().map(|s| s[comp_idx]).collect();
                    guess.push(extrapolate(self.parameters.extrapolation_method, &history.times, &series, t_new));
                }
            } else if self.window_index == 0 && !self.parameters.initialize_tear_streams_auto {
                guess.extend(stream.main.tear_vector(t1));
            } else {
                guess.extend(stream.main.default_tear_guess());
            }
        }
        guess
    }

    fn apply_tear_guess(&mut self, partition: &Partition, t: f64, values: &[f64]) {
        let mut offset = 0;
        for &stream_key in &partition.tear_streams {
            if let Some(stream) = self.flowsheet.streams.get_mut(stream_key) {
                let len = stream.main.tear_vector_len();
                let _ = stream.main.apply_tear_vector(t, &values[offset..offset + len]);
                offset += len;
            }
        }
    }

    fn read_tear_values(&mut self, partition: &Partition, t: f64) -> Vec<f64> {
        let mut out = Vec::new();
        for &stream_key in &partition.tear_streams {
            if let Some(stream) = self.flowsheet.streams.get_mut(stream_key) {
                out.extend(stream.main.tear_vector(t));
            }
        }
        out
    }

    fn commit_tear_history(&mut self, partition: &Partition, t: f64, values: &[f64]) {
        let mut offset = 0;
        for &stream_key in &partition.tear_streams {
            let len = self.flowsheet.streams.get(stream_key)
                .map(|s| s.main.tear_vector_len())
                .unwrap_or(0);
            let history = self.tear_history.entry(stream_key).or_default();
            history.push(t, values[offset..offset + len].to_vec());
            offset += len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowsheet::PhaseState;
    use crate::unit::{Holdup, ParameterManager, Port, PortDirection, Unit as UnitTrait};

    struct ConstantSource {
        key: String,
        ports: Vec<Port>,
        params: ParameterManager,
        holdups: Vec<Holdup>,
    }

    impl UnitTrait for ConstantSource {
        fn key(&self) -> &str { &self.key }
        fn ports(&self) -> &[Port] { &self.ports }
        fn ports_mut(&mut self) -> &mut [Port] { &mut self.ports }
        fn holdups(&self) -> &[Holdup] { &self.holdups }
        fn holdups_mut(&mut self) -> &mut [Holdup] { &mut self.holdups }
        fn parameters(&self) -> &ParameterManager { &self.params }
        fn parameters_mut(&mut self) -> &mut ParameterManager { &mut self.params }
        fn initialise(&mut self, _t0: f64, _ctx: &EngineContext) -> EngineResult<()> { Ok(()) }
        fn simulate(&mut self, _t1: f64, t2: f64, ports: &mut StreamPorts, _ctx: &EngineContext) -> Result<(), String> {
            let out = ports.output("out").map_err(|e| e.to_string())?;
            out.set_mass(t2, 1.0).map_err(|e| e.to_string())?;
            out.set_temperature(t2, 300.0).map_err(|e| e.to_string())?;
            out.set_pressure(t2, 1e5).map_err(|e| e.to_string())?;
            out.set_phase_fractions(t2, &[1.0]).map_err(|e| e.to_string())?;
            out.set_phase_composition("solid", t2, &[1.0]).map_err(|e| e.to_string())?;
            Ok(())
        }
    }

    struct PassThroughSink {
        key: String,
        ports: Vec<Port>,
        params: ParameterManager,
        holdups: Vec<Holdup>,
    }

    impl UnitTrait for PassThroughSink {
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

    fn source() -> Box<dyn UnitTrait> {
        Box::new(ConstantSource {
            key: "src".into(),
            ports: vec![Port::new("out", "Out", PortDirection::Output)],
            params: ParameterManager::new(),
            holdups: Vec::new(),
        })
    }

    fn sink() -> Box<dyn UnitTrait> {
        Box::new(PassThroughSink {
            key: "sink".into(),
            ports: vec![Port::new("in", "In", PortDirection::Input)],
            params: ParameterManager::new(),
            holdups: Vec::new(),
        })
    }

    #[test]
    fn single_chain_runs_to_completion() {
        let mut fs = Flowsheet::new();
        fs.add_compound("A");
        fs.add_phase("solid", "Solid", PhaseState::Solid);
        fs.add_unit("src", "Source", source()).unwrap();
        fs.add_unit("sink", "Sink", sink()).unwrap();
        fs.add_stream("s1", "Stream 1", "src", "out", "sink", "in", usize::MAX, None).unwrap();

        let mut params = ParametersHolder::default();
        params.end_simulation_time = 3.0;
        params.init_time_window = 1.0;

        let mut sim = Simulator::new(fs, params);
        let ctx = EngineContext::with_threads(1);
        sim.initialise(&ctx).unwrap();
        sim.run(&ctx).unwrap();
        assert!((sim.current_time() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn cancellation_stops_the_run_between_windows() {
        let mut fs = Flowsheet::new();
        fs.add_compound("A");
        fs.add_phase("solid", "Solid", PhaseState::Solid);
        fs.add_unit("src", "Source", source()).unwrap();
        fs.add_unit("sink", "Sink", sink()).unwrap();
        fs.add_stream("s1", "Stream 1", "src", "out", "sink", "in", usize::MAX, None).unwrap();

        let mut params = ParametersHolder::default();
        params.end_simulation_time = 100.0;
        params.init_time_window = 1.0;

        let mut sim = Simulator::new(fs, params);
        let ctx = EngineContext::with_threads(1);
        sim.initialise(&ctx).unwrap();
        ctx.cancel();
        let result = sim.run(&ctx);
        assert!(matches!(result, Err(EngineError::UserAborted)));
    }
}
