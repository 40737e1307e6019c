//! The probe object: sensor link, homing collaborator, settings and the
//! command dispatcher.
//!
//! `Scanner` is assembled by [`ScannerBuilder`] from host collaborators and
//! a parsed printer config. Command handlers live next to their feature
//! (`probe`, `touch`, `mesh`, ...) as further `impl Scanner` blocks; this
//! file only holds the shared motion helpers and the dispatch table.

use std::path::PathBuf;

use rand::SeedableRng;
use rand::rngs::StdRng;
use scanner_traits::{
    AxisTwist, BedMesh, Clock, ConfigStore, Homing, KinematicsStatus, Mcu, MonotonicClock,
    Printer, SampleFeed, TemperatureSource, Toolhead, TrajectoryQueue, TriggerSync,
};

use crate::commands::{Command, CommandParams, CommandTable};
use crate::config::{
    CalibrationSettings, MeshSettings, ProbeSettings, ScannerSettings, TouchSettings,
};
use crate::endstop::ScannerEndstop;
use crate::enrich::SampleEnricher;
use crate::error::{BuildError, Result, ScannerError, fail};
use crate::filter::AlphaBetaFilter;
use crate::hw_error::host;
use crate::mesh::path::auto_overscan;
use crate::model::ModelRegistry;
use crate::sensor::{Sensor, SensorLinks};
use crate::session::SessionId;
use crate::temp_model::TempModelBuilder;

/// Where `STREAM FILENAME=...` logs land unless configured otherwise.
pub const DEFAULT_STREAM_DIR: &str = "/tmp";

pub struct Scanner {
    pub(crate) sensor: Sensor,
    pub(crate) homing: Box<dyn Homing>,
    pub(crate) bed_mesh: Option<Box<dyn BedMesh>>,
    pub(crate) probe: ProbeSettings,
    pub(crate) touch: TouchSettings,
    pub(crate) calibration: CalibrationSettings,
    pub(crate) mesh: Option<MeshSettings>,
    pub(crate) commands: CommandTable,
    /// Jitter source for fuzzy touch.
    pub(crate) rng: StdRng,
    /// Extruder target saved while the nozzle cools for a touch.
    pub(crate) extruder_target: f64,
    pub(crate) last_z_result: f64,
    /// Session of the `STREAM` file logger, if running.
    pub(crate) log_stream: Option<SessionId>,
    pub(crate) stream_dir: PathBuf,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("sensor", &self.sensor)
            .field("commands", &self.commands.len())
            .field("last_z_result", &self.last_z_result)
            .field("streaming_to_file", &self.log_stream.is_some())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn builder() -> ScannerBuilder {
        ScannerBuilder::default()
    }

    pub fn sensor(&self) -> &Sensor {
        &self.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut Sensor {
        &mut self.sensor
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn probe_settings(&self) -> &ProbeSettings {
        &self.probe
    }

    pub fn touch_settings(&self) -> &TouchSettings {
        &self.touch
    }

    pub fn mesh_settings(&self) -> Option<&MeshSettings> {
        self.mesh.as_ref()
    }

    pub fn last_z_result(&self) -> f64 {
        self.last_z_result
    }

    /// Run one console command by name.
    pub fn run_command(&mut self, p: &CommandParams) -> Result<()> {
        let Some(cmd) = self.commands.resolve(p.command()) else {
            return Err(fail(ScannerError::host(format!(
                "Unknown command: \"{}\"",
                p.command()
            ))));
        };
        self.sensor.check_shutdown()?;
        let span = tracing::info_span!("command", name = %p.command().to_uppercase());
        let _enter = span.enter();
        tracing::debug!(?cmd, "dispatch");

        let result = match cmd {
            Command::Probe => self.cmd_probe(p),
            Command::ProbeAccuracy => self.cmd_probe_accuracy(p),
            Command::ZOffsetApplyProbe => self.cmd_z_offset_apply_probe(p),
            Command::BedMeshCalibrate => self.cmd_bed_mesh_calibrate(p),
            Command::Calibrate => self.start_calibration(p),
            Command::Touch => self.cmd_touch(p),
            Command::ThresholdScan => self.cmd_threshold_scan(p),
            Command::EstimateBacklash => self.cmd_estimate_backlash(p),
            Command::Query => self.cmd_query(p),
            Command::Stream => self.cmd_stream(p),
            Command::ProbeSwitch => self.cmd_probe_switch(p),
            Command::ModelSelect => self.cmd_model_select(p),
            Command::ModelSave => self.cmd_model_save(p),
            Command::ModelRemove => self.cmd_model_remove(p),
            Command::ModelList => self.cmd_model_list(p),
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "command failed");
        }
        result
    }

    /// Parse `NAME KEY=VALUE ...` and run it.
    pub fn run_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        let (name, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let params = CommandParams::parse(name, args)?;
        self.run_command(&params)
    }

    /// Home Z with the sensor as the endstop.
    pub fn home_z(&mut self) -> Result<()> {
        let mut endstop = ScannerEndstop::new(&mut self.sensor);
        host(self.homing.home_rails(&mut endstop, &[2]))
    }

    // ── Motion helpers ───────────────────────────────────────────────────

    pub(crate) fn respond(&mut self, msg: &str) {
        self.sensor.respond_info(msg);
    }

    pub(crate) fn position(&self) -> [f64; 3] {
        self.sensor.toolhead.get_position()
    }

    pub(crate) fn kinematics(&self) -> KinematicsStatus {
        self.sensor.toolhead.kinematics_status()
    }

    pub(crate) fn move_to(&mut self, coord: [Option<f64>; 3], speed: f64) -> Result<()> {
        host(self.sensor.toolhead.manual_move(coord, speed))
    }

    pub(crate) fn set_position(&mut self, pos: [f64; 3], homing_axes: &[usize]) -> Result<()> {
        host(self.sensor.toolhead.set_position(pos, homing_axes))
    }

    /// Wait for the planner, then drain samples up to the end of the moves.
    pub(crate) fn wait_moves(&mut self) -> Result<()> {
        self.sensor.wait_moves()
    }

    pub(crate) fn dwell(&mut self, secs: f64) -> Result<()> {
        host(self.sensor.toolhead.dwell(secs))
    }

    /// Probing move towards `pos` with the sensor as the endstop.
    pub(crate) fn probing_move(&mut self, pos: [f64; 3], speed: f64) -> Result<[f64; 3]> {
        let mut endstop = ScannerEndstop::new(&mut self.sensor);
        host(self.homing.probing_move(&mut endstop, pos, speed))
    }

    /// Lift to `z_hop_dist`. Without a homed Z the current height is
    /// declared zero for the lift and Z is marked unhomed again after.
    pub(crate) fn zhop(&mut self) -> Result<()> {
        let dist = self.probe.z_hop_dist;
        if dist <= 0.0 {
            return Ok(());
        }
        let speed = self.probe.z_hop_speed;
        let target = [None, None, Some(dist)];
        if !self.kinematics().is_homed('z') {
            let mut pos = self.position();
            pos[2] = 0.0;
            self.set_position(pos, &[2])?;
            self.move_to(target, speed)?;
            self.wait_moves()?;
            self.sensor.toolhead.note_z_not_homed();
        } else if self.position()[2] < dist {
            self.move_to(target, speed)?;
            self.wait_moves()?;
        }
        Ok(())
    }
}

/// Assembles a [`Scanner`] from host collaborators and settings.
#[derive(Default)]
pub struct ScannerBuilder {
    settings: Option<ScannerSettings>,
    models: Option<ModelRegistry>,
    tempco: Option<TempModelBuilder>,
    mcu: Option<Box<dyn Mcu>>,
    feed: Option<Box<dyn SampleFeed>>,
    trapq: Option<Box<dyn TrajectoryQueue>>,
    toolhead: Option<Box<dyn Toolhead>>,
    trsync: Option<Box<dyn TriggerSync>>,
    printer: Option<Box<dyn Printer>>,
    store: Option<Box<dyn ConfigStore>>,
    homing: Option<Box<dyn Homing>>,
    bed_mesh: Option<Box<dyn BedMesh>>,
    temp_override: Option<Box<dyn TemperatureSource>>,
    axis_twist: Option<Box<dyn AxisTwist>>,
    clock: Option<Box<dyn Clock>>,
    seed: Option<u64>,
    stream_dir: Option<PathBuf>,
}

impl ScannerBuilder {
    /// Settings, stored models and tempco parameters from a printer config.
    #[must_use]
    pub fn with_config(mut self, cfg: &scanner_config::Config) -> Self {
        self.settings = Some(ScannerSettings::from(cfg));
        self.models = Some(ModelRegistry::from_cfg(&cfg.models));
        self.tempco = Some(TempModelBuilder::from(&cfg.scanner));
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ScannerSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    #[must_use]
    pub fn with_models(mut self, models: ModelRegistry) -> Self {
        self.models = Some(models);
        self
    }

    #[must_use]
    pub fn with_tempco(mut self, tempco: TempModelBuilder) -> Self {
        self.tempco = Some(tempco);
        self
    }

    #[must_use]
    pub fn with_mcu(mut self, mcu: impl Mcu + 'static) -> Self {
        self.mcu = Some(Box::new(mcu));
        self
    }

    #[must_use]
    pub fn with_feed(mut self, feed: impl SampleFeed + 'static) -> Self {
        self.feed = Some(Box::new(feed));
        self
    }

    #[must_use]
    pub fn with_trapq(mut self, trapq: impl TrajectoryQueue + 'static) -> Self {
        self.trapq = Some(Box::new(trapq));
        self
    }

    #[must_use]
    pub fn with_toolhead(mut self, toolhead: impl Toolhead + 'static) -> Self {
        self.toolhead = Some(Box::new(toolhead));
        self
    }

    #[must_use]
    pub fn with_trsync(mut self, trsync: impl TriggerSync + 'static) -> Self {
        self.trsync = Some(Box::new(trsync));
        self
    }

    #[must_use]
    pub fn with_printer(mut self, printer: impl Printer + 'static) -> Self {
        self.printer = Some(Box::new(printer));
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: impl ConfigStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    #[must_use]
    pub fn with_homing(mut self, homing: impl Homing + 'static) -> Self {
        self.homing = Some(Box::new(homing));
        self
    }

    #[must_use]
    pub fn with_bed_mesh(mut self, bed_mesh: impl BedMesh + 'static) -> Self {
        self.bed_mesh = Some(Box::new(bed_mesh));
        self
    }

    /// Coil temperature from another sensor instead of the thermistor.
    #[must_use]
    pub fn with_temp_override(mut self, source: impl TemperatureSource + 'static) -> Self {
        self.temp_override = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_axis_twist(mut self, twist: impl AxisTwist + 'static) -> Self {
        self.axis_twist = Some(Box::new(twist));
        self
    }

    /// One host object filling every collaborator slot.
    #[must_use]
    pub fn with_host<H>(self, h: &H) -> Self
    where
        H: Mcu
            + SampleFeed
            + TrajectoryQueue
            + Toolhead
            + TriggerSync
            + Printer
            + ConfigStore
            + Homing
            + BedMesh
            + Clone
            + 'static,
    {
        self.with_mcu(h.clone())
            .with_feed(h.clone())
            .with_trapq(h.clone())
            .with_toolhead(h.clone())
            .with_trsync(h.clone())
            .with_printer(h.clone())
            .with_store(h.clone())
            .with_homing(h.clone())
            .with_bed_mesh(h.clone())
    }

    // Clock is injectable for tests; Box is accepted.
    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fixed seed for the fuzzy touch jitter.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_stream_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stream_dir = Some(dir.into());
        self
    }

    pub fn try_build(self) -> Result<Scanner> {
        let Self {
            settings,
            models,
            tempco,
            mcu,
            feed,
            trapq,
            toolhead,
            trsync,
            printer,
            store,
            homing,
            bed_mesh,
            temp_override,
            axis_twist,
            clock,
            seed,
            stream_dir,
        } = self;

        let mut mcu = mcu.ok_or_else(|| eyre::Report::new(BuildError::MissingMcu))?;
        let feed = feed.ok_or_else(|| eyre::Report::new(BuildError::MissingFeed))?;
        let trapq = trapq.ok_or_else(|| eyre::Report::new(BuildError::MissingTrapq))?;
        let toolhead = toolhead.ok_or_else(|| eyre::Report::new(BuildError::MissingToolhead))?;
        let trsync = trsync.ok_or_else(|| eyre::Report::new(BuildError::MissingTriggerSync))?;
        let printer = printer.ok_or_else(|| eyre::Report::new(BuildError::MissingPrinter))?;
        let store = store.ok_or_else(|| eyre::Report::new(BuildError::MissingConfigStore))?;
        let homing = homing.ok_or_else(|| eyre::Report::new(BuildError::MissingHoming))?;
        let ScannerSettings {
            sensor: sensor_settings,
            probe,
            touch,
            calibration,
            mut mesh,
            mode,
        } = settings.ok_or_else(|| eyre::Report::new(BuildError::MissingConfig))?;

        if sensor_settings.trigger_distance.is_nan() || sensor_settings.trigger_distance <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "trigger_distance must be > 0",
            )));
        }
        if !(0.0..1.0).contains(&sensor_settings.trigger_hysteresis) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "trigger_hysteresis must be in [0, 1)",
            )));
        }
        if probe.speed <= 0.0 || probe.lift_speed <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "probe speeds must be > 0",
            )));
        }
        if let Some(m) = &mesh {
            if m.cluster_size < 0.0 || m.runs == 0 {
                return Err(eyre::Report::new(BuildError::InvalidConfig(
                    "mesh cluster_size must be >= 0 and runs >= 1",
                )));
            }
        }

        let filter = AlphaBetaFilter::new(sensor_settings.filter_alpha, sensor_settings.filter_beta);
        let enricher = SampleEnricher::new(filter, mcu.as_ref());
        let base = host(mcu.base_read(6, 0))?.calibration();
        let tempco = tempco.unwrap_or_default().build_with_base(
            base,
            |count| enricher.count_to_freq(count),
            enricher.thermistor(),
            enricher.adc_scale(),
        );
        if tempco.is_none() {
            tracing::info!("no coil temperature compensation");
        }
        let enricher = enricher
            .with_tempco(tempco)
            .with_warning_disable(sensor_settings.warning_disable);

        let mut models = models.unwrap_or_default();
        if models.get(&calibration.default_model_name).is_some() {
            models.select(&calibration.default_model_name)?;
        }

        if let Some(m) = mesh.as_mut() {
            if m.overscan.is_none() {
                let kin = toolhead.kinematics_status();
                let overscan = auto_overscan(
                    m.min,
                    m.max,
                    m.probe_count,
                    [probe.x_offset, probe.y_offset],
                    m.direction,
                    kin.axis_minimum,
                    kin.axis_maximum,
                );
                tracing::debug!(overscan, "mesh overscan from machine limits");
                m.overscan = Some(overscan);
            }
        }

        let mut prefixes = vec![sensor_settings.name.clone()];
        prefixes.extend(sensor_settings.alt_name.clone());
        let commands = CommandTable::new(prefixes.iter().map(String::as_str));

        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let clock = clock.unwrap_or_else(|| Box::new(MonotonicClock::new()));
        let links = SensorLinks {
            mcu,
            feed,
            trapq,
            toolhead,
            trsync,
            printer,
            store,
            temp_override,
            axis_twist,
            clock,
        };
        let detect_threshold = touch.threshold;
        let mut sensor = Sensor::new(links, sensor_settings, enricher, models, mode, detect_threshold);
        sensor.update_thresholds()?;
        tracing::info!(
            name = sensor.name(),
            mode = mode.as_str(),
            model = ?sensor.model().map(|m| m.name.clone()),
            "scanner ready"
        );

        Ok(Scanner {
            sensor,
            homing,
            bed_mesh,
            probe,
            touch,
            calibration,
            mesh,
            commands,
            rng,
            extruder_target: 0.0,
            last_z_result: 0.0,
            log_stream: None,
            stream_dir: stream_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_STREAM_DIR)),
        })
    }

    pub fn build(self) -> Result<Scanner> {
        self.try_build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockMcu, NoMotion, ScriptedFeed};
    use scanner_hardware::{SimConfig, SimulatedPrinter};

    fn settings() -> ScannerSettings {
        ScannerSettings::default()
    }

    #[test]
    fn missing_collaborators_are_reported() {
        let err = Scanner::builder().with_settings(settings()).try_build().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingMcu)
        ));

        let (mcu, _) = MockMcu::new(48e6);
        let err = Scanner::builder()
            .with_mcu(mcu)
            .with_feed(ScriptedFeed::default())
            .with_trapq(NoMotion)
            .try_build()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingToolhead)
        ));
    }

    #[test]
    fn invalid_trigger_distance_is_rejected() {
        let sim = SimulatedPrinter::new(SimConfig::default());
        let mut s = settings();
        s.sensor.trigger_distance = 0.0;
        let err = Scanner::builder()
            .with_host(&sim)
            .with_settings(s)
            .try_build()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::InvalidConfig(_))
        ));
    }

    #[test]
    fn commands_are_registered_for_both_names() {
        let sim = SimulatedPrinter::new(SimConfig::default());
        let mut s = settings();
        s.sensor.alt_name = Some("scanner".to_string());
        let sc = Scanner::builder()
            .with_host(&sim)
            .with_clock(Box::new(sim.clock()))
            .with_settings(s)
            .with_seed(7)
            .try_build()
            .unwrap();
        assert_eq!(sc.commands().resolve("cartographer_query"), Some(Command::Query));
        assert_eq!(sc.commands().resolve("SCANNER_QUERY"), Some(Command::Query));
        assert_eq!(sc.commands().resolve("PROBE"), Some(Command::Probe));
    }

    #[test]
    fn unknown_command_is_an_error() {
        let sim = SimulatedPrinter::new(SimConfig::default());
        let mut sc = Scanner::builder()
            .with_host(&sim)
            .with_clock(Box::new(sim.clock()))
            .with_settings(settings())
            .try_build()
            .unwrap();
        let err = sc.run_line("NOT_A_COMMAND X=1").unwrap_err();
        assert!(err.to_string().contains("Unknown command"));
    }

    #[test]
    fn zhop_without_homed_z_lifts_from_zero_and_unhomes() {
        let sim = SimulatedPrinter::new(SimConfig::default());
        sim.home_xy();
        let mut s = settings();
        s.probe.z_hop_dist = 5.0;
        s.probe.z_hop_speed = 10.0;
        let mut sc = Scanner::builder()
            .with_host(&sim)
            .with_clock(Box::new(sim.clock()))
            .with_settings(s)
            .try_build()
            .unwrap();
        sc.zhop().unwrap();
        assert!((sc.position()[2] - 5.0).abs() < 1e-9);
        assert!(!sc.kinematics().is_homed('z'));
    }
}
