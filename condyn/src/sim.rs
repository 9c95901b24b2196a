//! Simulation driver: per-step pipeline and the blocking run loop.
//!
//! Each step advances every body to the mid-step and computes its free
//! velocity, detects the contact set, condenses the body dynamics onto it,
//! resolves all reactions with the injected [`ContactSolver`], and commits
//! the constrained velocities. Reactions are carried across steps per
//! persistent contact feature to warm-start the solver. An optional
//! [`StateSink`] receives snapshots at the output interval; a recorded run
//! can be played back through the same `run` call in [`RunMode::Replay`].

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::assembly::assemble;
use crate::detect;
use crate::history::{History, SeriesKey};
use crate::material::SurfaceMaterialSet;
use crate::objects::{Body, BodyId, BodyRegistry};
use crate::output::{BodyState, Snapshot, StateSink};
use crate::partition::DomainSet;
use crate::solvers::{ContactSolver, Monitor, NullMonitor, SolveInfo, Status};
use crate::timing::Timings;
use crate::{Error, Vec3};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimKind {
    Dynamic,
    /// Inertial terms dropped; the contact law bounds velocities by
    /// `max(gap, 0) / h`.
    QuasiStatic,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Step the physics and record snapshots into the sink.
    Write,
    /// Re-play previously recorded snapshots instead of stepping.
    Replay,
}

#[derive(Clone, Debug)]
pub struct SimParams {
    pub kind: SimKind,
    /// Time step `h`.
    pub step: f64,
    pub gravity: Vec3,
    /// Sparsification margin: contacts with a larger gap are dropped.
    pub margin: f64,
    /// Simulated time between snapshots; zero emits one per step.
    pub output_interval: f64,
    pub record_history: bool,
    /// Parallel solver domains; 1 runs serial.
    pub num_domains: usize,
    /// Load-imbalance ratio above which the balancer logs a rebalance.
    pub imbalance_tolerance: f64,
    pub mode: RunMode,
}

impl Default for SimParams {
    fn default() -> Self {
        SimParams {
            kind: SimKind::Dynamic,
            step: 1e-3,
            gravity: Vec3::zeros(),
            margin: 1e-3,
            output_interval: 0.0,
            record_history: false,
            num_domains: 1,
            imbalance_tolerance: 1.3,
            mode: RunMode::Write,
        }
    }
}

impl SimParams {
    pub fn with_kind(mut self, kind: SimKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    pub fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_output_interval(mut self, interval: f64) -> Self {
        self.output_interval = interval;
        self
    }

    pub fn with_history(mut self, record: bool) -> Self {
        self.record_history = record;
        self
    }

    pub fn with_domains(mut self, num_domains: usize) -> Self {
        self.num_domains = num_domains;
        self
    }

    /// One domain per available core.
    pub fn with_auto_domains(mut self) -> Self {
        self.num_domains = num_cpus::get();
        self
    }

    pub fn with_imbalance_tolerance(mut self, tolerance: f64) -> Self {
        self.imbalance_tolerance = tolerance;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Outcome of one step.
#[derive(Debug)]
pub struct StepReport {
    pub time: f64,
    pub contacts: usize,
    /// Near-miss samples dropped by the sparsification margin.
    pub sparsified: usize,
    /// Tributary surface area summed over the kept contacts.
    pub area: f64,
    pub solve: SolveInfo,
}

#[derive(Debug)]
pub struct RunSummary {
    pub steps: u64,
    pub time: f64,
    /// Solver iterations summed over the run.
    pub iterations: u64,
}

pub struct Simulation {
    params: SimParams,
    bodies: BodyRegistry,
    surfaces: SurfaceMaterialSet,
    history: History,
    sink: Option<Box<dyn StateSink>>,
    /// Frames loaded for replay.
    frames: Vec<Snapshot>,
    /// Reactions of the previous step, keyed by persistent contact feature.
    warm: AHashMap<(BodyId, BodyId, u32, u32), Vec3>,
    /// Per-body cost multipliers from the previous step's measured domain
    /// load, smoothed across steps.
    load: AHashMap<BodyId, f64>,
    time: f64,
    step_index: u64,
    next_output: f64,
}

impl Simulation {
    pub fn new(params: SimParams) -> Result<Self, Error> {
        if !(params.step > 0.0) || !params.step.is_finite() {
            return Err(Error::InvalidParameter {
                name: "time step".into(),
            });
        }
        if params.num_domains == 0 {
            return Err(Error::InvalidParameter {
                name: "domain count".into(),
            });
        }
        if !(params.margin >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "sparsification margin".into(),
            });
        }
        Ok(Simulation {
            params,
            bodies: BodyRegistry::new(),
            surfaces: SurfaceMaterialSet::default(),
            history: History::new(),
            sink: None,
            frames: Vec::new(),
            warm: AHashMap::new(),
            load: AHashMap::new(),
            time: 0.0,
            step_index: 0,
            next_output: 0.0,
        })
    }

    /// Registers a body, checking the step against its explicit-scheme
    /// stability bound.
    pub fn add_body(&mut self, body: Body) -> BodyId {
        let hc = body.critical_time_step();
        if self.params.step > hc {
            log::warn!(
                "time step {:.3e} exceeds critical step {:.3e} of body {:?}",
                self.params.step,
                hc,
                body.label
            );
        }
        self.bodies.add(body)
    }

    pub fn set_surfaces(&mut self, surfaces: SurfaceMaterialSet) {
        self.surfaces = surfaces;
    }

    pub fn surfaces_mut(&mut self) -> &mut SurfaceMaterialSet {
        &mut self.surfaces
    }

    pub fn set_sink(&mut self, sink: Box<dyn StateSink>) {
        self.sink = Some(sink);
    }

    /// Loads previously recorded frames for a [`RunMode::Replay`] run.
    pub fn load_frames(&mut self, frames: Vec<Snapshot>) {
        self.frames = frames;
    }

    pub fn registry(&self) -> &BodyRegistry {
        &self.bodies
    }

    pub fn registry_mut(&mut self) -> &mut BodyRegistry {
        &mut self.bodies
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    fn snapshot(&self, contact_count: usize) -> Snapshot {
        let bodies = self
            .bodies
            .iter()
            .map(|(id, body)| {
                let (configuration, velocity) = body.capture_state();
                BodyState {
                    id,
                    configuration,
                    velocity,
                }
            })
            .collect();
        Snapshot {
            step: self.step_index,
            time: self.time,
            bodies,
            contact_count,
        }
    }

    fn apply_snapshot(&mut self, frame: &Snapshot) -> Result<(), Error> {
        for state in &frame.bodies {
            let body = self.bodies.get_mut(state.id);
            if !body.restore_state(&state.configuration, &state.velocity) {
                return Err(Error::InvalidParameter {
                    name: format!("snapshot state of body {:?}", state.id),
                });
            }
        }
        self.time = frame.time;
        self.step_index = frame.step;
        Ok(())
    }

    fn record_step(&mut self, report: &StepReport) {
        let t = report.time;
        let mut kin_total = 0.0;
        let mut int_total = 0.0;
        let samples: Vec<(BodyId, f64, f64)> = self
            .bodies
            .iter()
            .filter(|(_, b)| !b.is_obstacle())
            .map(|(id, b)| (id, b.kinetic_energy(), b.internal_energy()))
            .collect();
        for (id, kin, int) in samples {
            kin_total += kin;
            int_total += int;
            self.history.record(SeriesKey::KineticEnergy(id), t, kin);
            self.history.record(SeriesKey::InternalEnergy(id), t, int);
        }
        self.history
            .record(SeriesKey::TotalKineticEnergy, t, kin_total);
        self.history
            .record(SeriesKey::TotalInternalEnergy, t, int_total);
        self.history
            .record(SeriesKey::ContactCount, t, report.contacts as f64);
        self.history
            .record(SeriesKey::SparsifiedCount, t, report.sparsified as f64);
        self.history.record(SeriesKey::ContactArea, t, report.area);
        self.history
            .record(SeriesKey::SolverIterations, t, report.solve.iterations as f64);
        self.history
            .record(SeriesKey::SolverResidual, t, report.solve.residual);
        self.history.record(SeriesKey::Merit, t, report.solve.merit);
    }

    /// Updates the per-body cost multipliers from the measured per-domain
    /// sweep durations of the last solve.
    fn observe_load(&mut self, set: &DomainSet, spent: &[Duration]) {
        if spent.len() != set.num_domains() {
            return;
        }
        let avg = spent.iter().map(Duration::as_secs_f64).sum::<f64>() / spent.len() as f64;
        if !(avg > 0.0) {
            return;
        }
        for (&id, &d) in set.body_domains() {
            let observed = spent[d].as_secs_f64() / avg;
            let w = self.load.entry(id).or_insert(1.0);
            *w = 0.5 * (*w + observed);
        }
    }

    /// Advances one step with a null monitor.
    pub fn step(&mut self, solver: &mut dyn ContactSolver) -> Result<StepReport, Error> {
        self.step_monitored(solver, &mut NullMonitor)
    }

    pub fn step_monitored(
        &mut self,
        solver: &mut dyn ContactSolver,
        monitor: &mut dyn Monitor,
    ) -> Result<StepReport, Error> {
        let h = self.params.step;
        let quasistatic = self.params.kind == SimKind::QuasiStatic;
        let mut timings = Timings::default();
        let step_start = Instant::now();

        let mark = Instant::now();
        for (_, body) in self.bodies.iter_mut() {
            body.step_begin(h, self.params.gravity, quasistatic);
        }
        timings.integration += mark.elapsed();

        let mark = Instant::now();
        let found = detect::detect(&self.bodies, &self.surfaces, self.params.margin)?;
        let contacts = found.contacts.len();
        let sparsified = found.sparsified;
        let area: f64 = found.contacts.iter().map(|c| c.area).sum();
        timings.detection += mark.elapsed();

        let mark = Instant::now();
        let mut ldy = assemble(&self.bodies, found.contacts, h, !quasistatic)?;
        for dia in ldy.blocks.iter_mut() {
            if let Some(&r) = self.warm.get(&warm_key(dia)) {
                dia.r = r;
            }
        }
        ldy.update_velocities();
        timings.assembly += mark.elapsed();

        let domains = if self.params.num_domains > 1 && !ldy.blocks.is_empty() {
            let mark = Instant::now();
            let set = DomainSet::partition_weighted(
                &self.bodies,
                &mut ldy,
                self.params.num_domains,
                &self.load,
            )?;
            timings.partitioning += mark.elapsed();
            if set.imbalance() > self.params.imbalance_tolerance {
                log::debug!(
                    "step {}: domain imbalance {:.2} above tolerance {:.2}, rebalanced",
                    self.step_index,
                    set.imbalance(),
                    self.params.imbalance_tolerance
                );
            }
            Some(set)
        } else {
            None
        };

        let mark = Instant::now();
        let solve = solver.solve(&mut ldy, domains.as_ref(), monitor)?;
        timings.solve += mark.elapsed();
        let detail = solver.timings();
        timings.communication += detail.communication;
        timings.solve_detail.accumulate(&detail);
        if let Some(set) = &domains {
            self.observe_load(set, solver.domain_load());
        }

        let mark = Instant::now();
        ldy.apply_reactions(&mut self.bodies);
        for (_, body) in self.bodies.iter_mut() {
            body.step_end(h, quasistatic);
        }
        timings.integration += mark.elapsed();

        self.warm.clear();
        for dia in &ldy.blocks {
            self.warm.insert(warm_key(dia), dia.r);
        }

        self.time += h;
        self.step_index += 1;

        let report = StepReport {
            time: self.time,
            contacts,
            sparsified,
            area,
            solve,
        };
        if self.params.record_history {
            self.record_step(&report);
        }

        let mark = Instant::now();
        let due = self.sink.is_some()
            && (self.params.output_interval <= 0.0 || self.time >= self.next_output - 1e-12);
        if due {
            let frame = self.snapshot(contacts);
            if let Some(sink) = self.sink.as_mut() {
                sink.write(&frame)?;
            }
            self.next_output = self.time + self.params.output_interval;
        }
        timings.output += mark.elapsed();

        timings.total = step_start.elapsed();
        self.history.accumulate_timings(&timings);

        log::debug!(
            "step {}: t {:.6}, {} contacts ({} sparsified), {} iterations, residual {:.3e}",
            self.step_index,
            self.time,
            contacts,
            sparsified,
            report.solve.iterations,
            report.solve.residual
        );
        Ok(report)
    }

    /// Runs for `duration` of simulated time: steps the physics in
    /// [`RunMode::Write`], plays back loaded frames in [`RunMode::Replay`].
    pub fn run(
        &mut self,
        solver: &mut dyn ContactSolver,
        duration: f64,
    ) -> Result<RunSummary, Error> {
        if self.params.mode == RunMode::Replay {
            return self.replay(duration);
        }

        let end = self.time + duration;
        let mut steps = 0;
        let mut iterations = 0;
        while self.time + 0.5 * self.params.step < end {
            let report = self.step(solver)?;
            steps += 1;
            iterations += report.solve.iterations as u64;
            if report.solve.status == Status::Interrupted {
                log::info!("run interrupted at t {:.6}", self.time);
                break;
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.finish()?;
        }
        log::info!(
            "run complete: {} steps to t {:.6}\n{}",
            steps,
            self.time,
            self.history.timings()
        );
        Ok(RunSummary {
            steps,
            time: self.time,
            iterations,
        })
    }

    fn replay(&mut self, duration: f64) -> Result<RunSummary, Error> {
        if self.frames.is_empty() {
            return Err(Error::NoRecordedFrames);
        }
        let end = self.time + duration;
        let mut steps = 0;
        for i in 0..self.frames.len() {
            let frame = self.frames[i].clone();
            if frame.time > end + 1e-12 {
                break;
            }
            self.apply_snapshot(&frame)?;
            steps += 1;
            if self.params.record_history {
                let report = StepReport {
                    time: frame.time,
                    contacts: frame.contact_count,
                    sparsified: 0,
                    area: 0.0,
                    solve: SolveInfo {
                        iterations: 0,
                        residual: 0.0,
                        merit: 0.0,
                        status: Status::Converged,
                    },
                };
                self.record_step(&report);
            }
        }
        log::info!("replayed {} frames to t {:.6}", steps, self.time);
        Ok(RunSummary {
            steps,
            time: self.time,
            iterations: 0,
        })
    }
}

fn warm_key(dia: &crate::assembly::DiagBlock) -> (BodyId, BodyId, u32, u32) {
    (
        dia.contact.master,
        dia.contact.slave,
        dia.contact.mfeat,
        dia.contact.sfeat,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{BulkMaterial, SurfaceMaterial, SurfaceMaterialSet};
    use crate::objects::{Kinematics, RigidScheme};
    use crate::shape::ConvexPolyhedron;
    use crate::solvers::{GaussSeidel, GaussSeidelParams};
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn dropped_cube_sim() -> Simulation {
        let params = SimParams::default()
            .with_step(1e-3)
            .with_gravity(Vec3::new(0.0, 0.0, -10.0))
            .with_history(true);
        let mut sim = Simulation::new(params).unwrap();
        sim.set_surfaces(SurfaceMaterialSet::new(SurfaceMaterial::new(0.3, 0.0)));
        let bulk = BulkMaterial::new(1.0e9, 0.25, 1.0e3).validated().unwrap();
        sim.add_body(Body::obstacle(
            "floor",
            ConvexPolyhedron::cuboid(Vec3::new(-5.0, -5.0, -1.0), Vec3::new(5.0, 5.0, 0.0)),
            0,
        ));
        sim.add_body(
            Body::rigid(
                "cube",
                ConvexPolyhedron::cuboid(Vec3::new(-0.5, -0.5, 0.0), Vec3::new(0.5, 0.5, 1.0)),
                bulk,
                0,
                RigidScheme::Stabilized,
            )
            .unwrap(),
        );
        sim
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(Simulation::new(SimParams::default().with_step(0.0)).is_err());
        assert!(Simulation::new(SimParams::default().with_domains(0)).is_err());
        assert!(Simulation::new(SimParams::default().with_margin(-1.0)).is_err());
    }

    #[test]
    fn resting_cube_stays_put() {
        let mut sim = dropped_cube_sim();
        let mut solver = GaussSeidel::new(GaussSeidelParams::default().with_epsilon(1e-6));
        let summary = sim.run(&mut solver, 0.05).unwrap();
        assert_eq!(summary.steps, 50);
        assert_relative_eq!(sim.time(), 0.05, max_relative = 1e-9);

        let cube = sim.registry().get(BodyId(1));
        if let Kinematics::Rigid(b) = &cube.kinematics {
            assert!(b.linvel.norm() < 1e-5, "cube drifted: {:?}", b.linvel);
            assert_relative_eq!(b.center.z, 0.5, epsilon = 1e-4);
        } else {
            unreachable!();
        }
        // History carried the run.
        assert_eq!(
            sim.history().series(SeriesKey::ContactCount).len(),
            50
        );
        let (_, last_kin) = sim.history().last(SeriesKey::TotalKineticEnergy).unwrap();
        assert!(last_kin < 1e-6);
        // Four corner samples share the touching surface.
        let (_, area) = sim.history().last(SeriesKey::ContactArea).unwrap();
        assert!(area > 0.0);
    }

    /// Pushes frames into a vector shared with the test body.
    struct SharedSink(Rc<RefCell<Vec<Snapshot>>>);

    impl StateSink for SharedSink {
        fn write(&mut self, snapshot: &Snapshot) -> Result<(), Error> {
            self.0.borrow_mut().push(snapshot.clone());
            Ok(())
        }
    }

    #[test]
    fn record_and_replay_round_trip() {
        let mut sim = dropped_cube_sim();
        let recorded = Rc::new(RefCell::new(Vec::new()));
        sim.set_sink(Box::new(SharedSink(Rc::clone(&recorded))));
        let mut solver = GaussSeidel::new(GaussSeidelParams::default());
        sim.run(&mut solver, 0.01).unwrap();
        let frames = recorded.borrow().clone();
        assert_eq!(frames.len(), 10);

        let mut replay = dropped_cube_sim();
        replay.params.mode = RunMode::Replay;
        replay.load_frames(frames);
        let summary = replay.run(&mut solver, 1.0).unwrap();
        assert_eq!(summary.steps, 10);
        assert_relative_eq!(replay.time(), 0.01, max_relative = 1e-9);

        let a = sim.registry().get(BodyId(1)).capture_state();
        let b = replay.registry().get(BodyId(1)).capture_state();
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn replay_without_frames_fails() {
        let mut sim = dropped_cube_sim();
        sim.params.mode = RunMode::Replay;
        let mut solver = GaussSeidel::new(GaussSeidelParams::default());
        assert!(matches!(
            sim.run(&mut solver, 1.0),
            Err(Error::NoRecordedFrames)
        ));
    }

    #[test]
    fn warm_start_cuts_iterations() {
        let mut sim = dropped_cube_sim();
        let mut solver = GaussSeidel::new(GaussSeidelParams::default());
        let first = sim.step(&mut solver).unwrap();
        // A couple of settle steps, then the carried reactions should make
        // the solve nearly free.
        for _ in 0..5 {
            sim.step(&mut solver).unwrap();
        }
        let warmed = sim.step(&mut solver).unwrap();
        assert!(warmed.solve.iterations <= first.solve.iterations);
    }
}
