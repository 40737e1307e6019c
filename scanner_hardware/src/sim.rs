//! Deterministic printer and eddy-current sensor simulator.
//!
//! One `SimulatedPrinter` handle is cloned into every host trait slot; all
//! clones share a single `SimState`. Time is print time, advanced only by
//! planner waits, emitted samples and feed timeouts, and mirrored into a
//! shared `ManualClock` so watchdogs see the same timeline.
//!
//! Physical model:
//! - coil frequency `f(d) = f0 * (1 + gain / (1 + d / length))`, `d` being
//!   the coil-to-bed gap under the sensor offset;
//! - bed surface is a tilted plane around `bed_origin`;
//! - a scan trigger fires where the raw count reaches the armed trigger count;
//! - a touch trigger fires at the bed minus a threshold-dependent compression
//!   plus seeded noise whose spread shrinks as the threshold grows.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scanner_config::{Config, PendingConfig};
use scanner_traits::mcu::reason;
use scanner_traits::{
    BaseCalibration, BaseRead, BedLeveling, BedMesh, ConfigStore, HeaterStatus, HostResult, Homing, HomingEndstop,
    HomingState, KinematicsStatus, ManualClock, Mcu, McuCommand, Printer, RawSample, SampleFeed,
    TemperatureSource, Toolhead, TrajectoryQueue, TrapMove, TriggerSync, ZMesh,
};

use crate::error::HwError;
use crate::wire::{encode_base, render};

const COUNT_SCALE: f64 = (1u64 << 28) as f64;

/// Thermistor constants of the coil board (pullup 10k, beta 4041 @ 25C/47k).
const PULLUP: f64 = 10_000.0;
const BETA_T1: f64 = 25.0;
const BETA_R1: f64 = 47_000.0;
const BETA: f64 = 4041.0;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub sensor: String,
    pub mcu_freq: f64,
    pub adc_max: f64,
    pub adc_smooth_count: f64,
    pub firmware_version: String,
    /// Samples per second of print time.
    pub sample_rate: f64,
    pub coil_f0: f64,
    pub coil_gain: f64,
    pub coil_length: f64,
    /// Fractional frequency shift per degree above 25C.
    pub coil_tempco: f64,
    /// Gaussian frequency noise, Hz.
    pub freq_noise: f64,
    pub coil_temp: f64,
    pub bed_origin: [f64; 2],
    pub bed_tilt: [f64; 2],
    pub bed_offset: f64,
    pub sensor_offset: [f64; 2],
    pub axis_min: [f64; 3],
    pub axis_max: [f64; 3],
    pub max_accel: f64,
    /// Physical start position of the nozzle.
    pub start_position: [f64; 3],
    pub homing_speed: f64,
    /// Nozzle compression per threshold unit at touch trigger, mm.
    pub touch_compression: f64,
    /// Touch trigger spread is `touch_noise / threshold`, mm.
    pub touch_noise: f64,
    pub paper_thickness: f64,
    pub trsync_mcus: usize,
    pub base: Option<BaseCalibration>,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sensor: "cartographer".to_string(),
            mcu_freq: 48_000_000.0,
            adc_max: 4095.0,
            adc_smooth_count: 16.0,
            firmware_version: "CARTOGRAPHER 5.1.0".to_string(),
            sample_rate: 500.0,
            coil_f0: 2_500_000.0,
            coil_gain: 0.3,
            coil_length: 1.5,
            coil_tempco: 0.0,
            freq_noise: 0.0,
            coil_temp: 30.0,
            bed_origin: [117.5, 117.5],
            bed_tilt: [0.001, -0.0005],
            bed_offset: 0.0,
            sensor_offset: [0.0, 0.0],
            axis_min: [0.0, 0.0, -2.0],
            axis_max: [235.0, 235.0, 250.0],
            max_accel: 3000.0,
            start_position: [117.5, 117.5, 10.0],
            homing_speed: 5.0,
            touch_compression: 0.000_01,
            touch_noise: 15.0,
            paper_thickness: 0.1,
            trsync_mcus: 1,
            base: None,
            seed: 0x5eed,
        }
    }
}

impl SimConfig {
    /// Machine geometry and sensor offsets taken from a printer config.
    pub fn for_printer(cfg: &Config) -> Self {
        let mut sim = Self {
            axis_min: cfg.printer.position_min,
            axis_max: cfg.printer.position_max,
            max_accel: cfg.printer.max_accel,
            sensor_offset: [cfg.scanner.x_offset, cfg.scanner.y_offset],
            ..Self::default()
        };
        if let Some(sensor) = cfg.scanner.sensor.as_ref().or(cfg.scanner.sensor_alt.as_ref()) {
            sim.sensor.clone_from(sensor);
        }
        let loc = cfg.touch_location();
        sim.bed_origin = loc;
        sim.start_position = [loc[0], loc[1], 10.0];
        sim
    }

    /// Frequency divider tiers of the sensor MCU.
    pub fn sensor_freq(&self) -> f64 {
        if self.mcu_freq < 20_000_000.0 {
            self.mcu_freq
        } else if self.mcu_freq < 100_000_000.0 {
            self.mcu_freq / 2.0
        } else {
            self.mcu_freq / 6.0
        }
    }

    pub fn coil_freq(&self, gap: f64, temp: f64) -> f64 {
        let gap = gap.max(-0.5 * self.coil_length);
        let f = self.coil_f0 * (1.0 + self.coil_gain / (1.0 + gap / self.coil_length));
        f * (1.0 + self.coil_tempco * (temp - 25.0))
    }

    /// Gap at which the coil reads `freq` (inverse of `coil_freq` at 25C).
    pub fn coil_gap(&self, freq: f64) -> f64 {
        let ratio = freq / self.coil_f0 - 1.0;
        if ratio <= 0.0 {
            return f64::INFINITY;
        }
        self.coil_length * (self.coil_gain / ratio - 1.0)
    }

    pub fn freq_to_count(&self, freq: f64) -> f64 {
        freq * COUNT_SCALE / self.sensor_freq()
    }

    pub fn count_to_freq(&self, count: f64) -> f64 {
        count * self.sensor_freq() / COUNT_SCALE
    }

    /// Raw smoothed ADC accumulator the board reports at `temp` Celsius.
    pub fn temp_to_raw(&self, temp: f64) -> u32 {
        let c2 = 1.0 / BETA;
        let c1 = 1.0 / (BETA_T1 + 273.15) - c2 * BETA_R1.ln();
        let ln_r = (1.0 / (temp + 273.15) - c1) / c2;
        let r = ln_r.exp();
        let adc = r / (PULLUP + r);
        (adc * self.adc_max * self.adc_smooth_count).round() as u32
    }
}

#[derive(Debug, Clone, Copy)]
struct SimMove {
    mv: TrapMove,
    /// Commanded minus physical position while this move was queued.
    offset: [f64; 3],
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    threshold: u32,
    method: u8,
}

#[derive(Debug)]
struct SimState {
    cfg: SimConfig,
    clock: ManualClock,
    rng: StdRng,
    now: f64,
    next_sample_time: f64,
    last_move_time: f64,
    last_clock64: u64,
    stream_en: bool,
    stalled: bool,
    coil_fault: bool,
    sent: Vec<McuCommand>,
    trigger_count: Option<u32>,
    armed: Option<Armed>,
    trsync_reason: u8,
    moves: Vec<SimMove>,
    cmd_pos: [f64; 3],
    offset: [f64; 3],
    homed: [bool; 3],
    max_accel: f64,
    heater: HeaterStatus,
    console: Vec<String>,
    shutdown: Option<String>,
    homing_origin_z: f64,
    bed_leveling: Option<BedLeveling>,
    objects: Option<Vec<Vec<[f64; 2]>>>,
    pending: PendingConfig,
    mesh: Option<ZMesh>,
    profiles: BTreeMap<String, ZMesh>,
    manual_probe_abort: bool,
}

impl SimState {
    fn new(cfg: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        let start = cfg.start_position;
        let max_accel = cfg.max_accel;
        Self {
            cfg,
            clock: ManualClock::new(),
            rng,
            now: 1.0,
            next_sample_time: 1.0,
            last_move_time: 1.0,
            last_clock64: 0,
            stream_en: false,
            stalled: false,
            coil_fault: false,
            sent: Vec::new(),
            trigger_count: None,
            armed: None,
            trsync_reason: reason::HOST_REQUEST,
            moves: Vec::new(),
            cmd_pos: start,
            offset: [0.0; 3],
            homed: [false; 3],
            max_accel,
            heater: HeaterStatus {
                temperature: 25.0,
                target: 0.0,
            },
            console: Vec::new(),
            shutdown: None,
            homing_origin_z: 0.0,
            bed_leveling: None,
            objects: None,
            pending: PendingConfig::new(),
            mesh: None,
            profiles: BTreeMap::new(),
            manual_probe_abort: false,
        }
    }

    fn advance_to(&mut self, t: f64) {
        if t > self.now {
            self.clock.advance(Duration::from_secs_f64(t - self.now));
            self.now = t;
        }
    }

    fn flush_time(&mut self) -> f64 {
        self.last_move_time = self.last_move_time.max(self.now);
        self.last_move_time
    }

    fn gauss(&mut self) -> f64 {
        let u1: f64 = self.rng.r#gen::<f64>().max(1e-12);
        let u2: f64 = self.rng.r#gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    fn bed_height(&self, x: f64, y: f64) -> f64 {
        let c = &self.cfg;
        c.bed_offset + c.bed_tilt[0] * (x - c.bed_origin[0]) + c.bed_tilt[1] * (y - c.bed_origin[1])
    }

    fn move_at(&self, t: f64) -> Option<&SimMove> {
        let idx = self.moves.partition_point(|m| m.mv.print_time <= t);
        idx.checked_sub(1).map(|i| &self.moves[i])
    }

    fn phys_at(&self, t: f64) -> [f64; 3] {
        match self.move_at(t) {
            Some(m) => {
                let (pos, _) = m.mv.position_at(t);
                [
                    pos[0] - m.offset[0],
                    pos[1] - m.offset[1],
                    pos[2] - m.offset[2],
                ]
            }
            None => self.cfg.start_position,
        }
    }

    fn phys_now(&self) -> [f64; 3] {
        [
            self.cmd_pos[0] - self.offset[0],
            self.cmd_pos[1] - self.offset[1],
            self.cmd_pos[2] - self.offset[2],
        ]
    }

    fn coil_gap(&self, phys: [f64; 3]) -> f64 {
        let so = self.cfg.sensor_offset;
        phys[2] - self.bed_height(phys[0] + so[0], phys[1] + so[1])
    }

    fn emit_sample(&mut self) -> RawSample {
        let t = self.next_sample_time;
        self.advance_to(t);
        self.next_sample_time = t + 1.0 / self.cfg.sample_rate;
        let gap = self.coil_gap(self.phys_at(t));
        let temp = self.cfg.coil_temp;
        let mut freq = self.cfg.coil_freq(gap, temp);
        if self.cfg.freq_noise > 0.0 {
            freq += self.gauss() * self.cfg.freq_noise;
        }
        let data = if self.coil_fault {
            0x0FFF_FFFF
        } else {
            self.cfg.freq_to_count(freq).round() as u32
        };
        let clock64 = (t * self.cfg.mcu_freq).round() as u64;
        self.last_clock64 = clock64;
        RawSample {
            clock: clock64 as u32,
            data,
            temp: self.cfg.temp_to_raw(temp),
        }
    }

    fn queue_move(&mut self, target: [f64; 3], speed: f64) {
        let from = self.cmd_pos;
        let delta = [target[0] - from[0], target[1] - from[1], target[2] - from[2]];
        let len = (delta[0].powi(2) + delta[1].powi(2) + delta[2].powi(2)).sqrt();
        if len < 1e-9 || speed <= 0.0 {
            self.cmd_pos = target;
            return;
        }
        let start = self.flush_time();
        let move_t = len / speed;
        self.moves.push(SimMove {
            mv: TrapMove {
                print_time: start,
                move_t,
                start_v: speed,
                accel: 0.0,
                start_pos: from,
                axes_r: [delta[0] / len, delta[1] / len, delta[2] / len],
            },
            offset: self.offset,
        });
        self.cmd_pos = target;
        self.last_move_time = start + move_t;
    }

    fn set_position(&mut self, pos: [f64; 3], homing_axes: &[usize]) {
        let phys = self.phys_now();
        let at = self.flush_time();
        self.offset = [pos[0] - phys[0], pos[1] - phys[1], pos[2] - phys[2]];
        self.cmd_pos = pos;
        self.moves.push(SimMove {
            mv: TrapMove {
                print_time: at,
                move_t: 0.0,
                start_v: 0.0,
                accel: 0.0,
                start_pos: pos,
                axes_r: [0.0; 3],
            },
            offset: self.offset,
        });
        for &axis in homing_axes {
            if let Some(h) = self.homed.get_mut(axis) {
                *h = true;
            }
        }
    }

    /// Physical Z at which the armed trigger fires under the current XY.
    fn trigger_z(&mut self) -> Option<f64> {
        let armed = self.armed?;
        let phys = self.phys_now();
        if armed.method == 0 {
            let count = self.trigger_count?;
            let gap = self.cfg.coil_gap(self.cfg.count_to_freq(f64::from(count)));
            let so = self.cfg.sensor_offset;
            Some(self.bed_height(phys[0] + so[0], phys[1] + so[1]) + gap)
        } else {
            let thr = f64::from(armed.threshold.max(1));
            let sigma = self.cfg.touch_noise / thr;
            let noise = self.gauss() * sigma;
            Some(self.bed_height(phys[0], phys[1]) - thr * self.cfg.touch_compression + noise)
        }
    }

    fn run_probe_move(&mut self, target: [f64; 3], speed: f64) -> [f64; 3] {
        let from = self.cmd_pos;
        let phys_from = self.phys_now()[2];
        let phys_to = target[2] - self.offset[2];
        let frac = match self.trigger_z() {
            Some(tz) if phys_from <= tz => Some(0.0),
            Some(tz) if phys_to <= tz && phys_from > phys_to => {
                Some((phys_from - tz) / (phys_from - phys_to))
            }
            _ => None,
        };
        let f = frac.unwrap_or(1.0);
        let stop = [
            from[0] + (target[0] - from[0]) * f,
            from[1] + (target[1] - from[1]) * f,
            from[2] + (target[2] - from[2]) * f,
        ];
        self.queue_move(stop, speed);
        self.trsync_reason = if frac.is_some() {
            reason::ENDSTOP_HIT
        } else {
            reason::PAST_END_TIME
        };
        tracing::trace!(?stop, hit = frac.is_some(), "sim probing move");
        stop
    }

    fn kinematics(&self) -> KinematicsStatus {
        let homed_axes = ['x', 'y', 'z']
            .iter()
            .zip(self.homed)
            .filter(|(_, h)| *h)
            .map(|(c, _)| *c)
            .collect();
        KinematicsStatus {
            homed_axes,
            axis_minimum: self.cfg.axis_min,
            axis_maximum: self.cfg.axis_max,
        }
    }
}

/// Handle onto the shared simulation; clone it into every collaborator slot.
#[derive(Debug, Clone)]
pub struct SimulatedPrinter {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedPrinter {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState::new(cfg))),
        }
    }

    pub fn config(&self) -> SimConfig {
        self.state.borrow().cfg.clone()
    }

    /// Shared clock mirroring simulated print time.
    pub fn clock(&self) -> ManualClock {
        self.state.borrow().clock.clone()
    }

    pub fn now(&self) -> f64 {
        self.state.borrow().now
    }

    pub fn console(&self) -> Vec<String> {
        self.state.borrow().console.clone()
    }

    pub fn take_console(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().console)
    }

    pub fn sent(&self) -> Vec<McuCommand> {
        self.state.borrow().sent.clone()
    }

    /// Sent commands rendered as wire messages.
    pub fn sent_wire(&self) -> Vec<String> {
        let st = self.state.borrow();
        st.sent.iter().map(|c| render(&st.cfg.sensor, c)).collect()
    }

    pub fn pending(&self) -> PendingConfig {
        self.state.borrow().pending.clone()
    }

    pub fn mesh(&self) -> Option<ZMesh> {
        self.state.borrow().mesh.clone()
    }

    pub fn profiles(&self) -> Vec<String> {
        self.state.borrow().profiles.keys().cloned().collect()
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.state.borrow().shutdown.clone()
    }

    pub fn physical_position(&self) -> [f64; 3] {
        self.state.borrow().phys_now()
    }

    pub fn bed_height(&self, x: f64, y: f64) -> f64 {
        self.state.borrow().bed_height(x, y)
    }

    /// Current coil-to-bed gap under the sensor.
    pub fn coil_gap(&self) -> f64 {
        let st = self.state.borrow();
        st.coil_gap(st.phys_now())
    }

    pub fn is_streaming(&self) -> bool {
        self.state.borrow().stream_en
    }

    /// Stop delivering samples while streaming stays enabled.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.borrow_mut().stalled = stalled;
    }

    /// Report the shorted-coil sentinel instead of real counts.
    pub fn set_coil_fault(&self, fault: bool) {
        self.state.borrow_mut().coil_fault = fault;
    }

    pub fn set_homing_origin_z(&self, z: f64) {
        self.state.borrow_mut().homing_origin_z = z;
    }

    pub fn set_bed_leveling(&self, lev: Option<BedLeveling>) {
        self.state.borrow_mut().bed_leveling = lev;
    }

    pub fn set_excluded_objects(&self, objects: Option<Vec<Vec<[f64; 2]>>>) {
        self.state.borrow_mut().objects = objects;
    }

    pub fn set_extruder(&self, temperature: f64, target: f64) {
        self.state.borrow_mut().heater = HeaterStatus {
            temperature,
            target,
        };
    }

    pub fn set_manual_probe_abort(&self, abort: bool) {
        self.state.borrow_mut().manual_probe_abort = abort;
    }

    /// Mark X and Y homed at the current position.
    pub fn home_xy(&self) {
        let mut st = self.state.borrow_mut();
        st.homed[0] = true;
        st.homed[1] = true;
    }

    /// Declare Z homed with the commanded frame matching physical height.
    pub fn home_z_physical(&self) {
        let mut st = self.state.borrow_mut();
        let phys = st.phys_now();
        let pos = [st.cmd_pos[0], st.cmd_pos[1], phys[2]];
        st.set_position(pos, &[2]);
    }
}

impl Mcu for SimulatedPrinter {
    fn clock_freq(&self) -> f64 {
        self.state.borrow().cfg.mcu_freq
    }

    fn adc_max(&self) -> f64 {
        self.state.borrow().cfg.adc_max
    }

    fn adc_smooth_count(&self) -> f64 {
        self.state.borrow().cfg.adc_smooth_count
    }

    fn firmware_version(&self) -> String {
        self.state.borrow().cfg.firmware_version.clone()
    }

    fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        let last = self.state.borrow().last_clock64;
        let diff = clock32.wrapping_sub(last as u32) as i32;
        last.wrapping_add_signed(i64::from(diff))
    }

    fn clock_to_print_time(&self, clock: u64) -> f64 {
        clock as f64 / self.state.borrow().cfg.mcu_freq
    }

    fn print_time_to_clock(&self, print_time: f64) -> u64 {
        (print_time * self.state.borrow().cfg.mcu_freq).max(0.0) as u64
    }

    fn send(&mut self, cmd: McuCommand) -> HostResult<()> {
        let mut st = self.state.borrow_mut();
        match cmd {
            McuCommand::Stream { en } => {
                st.stream_en = en != 0;
                if st.stream_en {
                    st.next_sample_time = st.next_sample_time.max(st.now);
                }
            }
            McuCommand::SetThreshold { trigger, .. } => st.trigger_count = Some(trigger),
            McuCommand::Home {
                threshold,
                trigger_method,
                ..
            } => {
                st.armed = Some(Armed {
                    threshold,
                    method: trigger_method,
                });
            }
            McuCommand::StopHome => st.armed = None,
        }
        st.sent.push(cmd);
        Ok(())
    }

    fn base_read(&mut self, len: u8, offset: u16) -> HostResult<BaseRead> {
        let st = self.state.borrow();
        let mut bytes = match st.cfg.base {
            Some(base) => encode_base(base),
            None => vec![0xFF; 6],
        };
        bytes.resize(usize::from(len), 0xFF);
        Ok(BaseRead { bytes, offset })
    }
}

impl SampleFeed for SimulatedPrinter {
    fn recv(&mut self, timeout: Duration) -> Option<RawSample> {
        let mut st = self.state.borrow_mut();
        if !st.stream_en || st.stalled || st.shutdown.is_some() {
            let t = st.now + timeout.as_secs_f64();
            st.advance_to(t);
            return None;
        }
        Some(st.emit_sample())
    }
}

impl TrajectoryQueue for SimulatedPrinter {
    fn extract(&self, print_time: f64) -> Option<TrapMove> {
        self.state.borrow().move_at(print_time).map(|m| m.mv)
    }
}

impl Toolhead for SimulatedPrinter {
    fn get_position(&self) -> [f64; 3] {
        self.state.borrow().cmd_pos
    }

    fn manual_move(&mut self, coord: [Option<f64>; 3], speed: f64) -> HostResult<()> {
        let mut st = self.state.borrow_mut();
        if let Some(msg) = &st.shutdown {
            return Err(Box::new(HwError::Shutdown(msg.clone())));
        }
        let cur = st.cmd_pos;
        let target = [
            coord[0].unwrap_or(cur[0]),
            coord[1].unwrap_or(cur[1]),
            coord[2].unwrap_or(cur[2]),
        ];
        for axis in 0..3 {
            if coord[axis].is_some()
                && st.homed[axis]
                && (target[axis] < st.cfg.axis_min[axis] - 1e-9
                    || target[axis] > st.cfg.axis_max[axis] + 1e-9)
            {
                return Err(Box::new(HwError::OutOfRange(format!(
                    "Move out of range: {:.3} {:.3} {:.3}",
                    target[0], target[1], target[2]
                ))));
            }
        }
        st.queue_move(target, speed);
        Ok(())
    }

    fn set_position(&mut self, pos: [f64; 3], homing_axes: &[usize]) -> HostResult<()> {
        self.state.borrow_mut().set_position(pos, homing_axes);
        Ok(())
    }

    fn wait_moves(&mut self) -> HostResult<()> {
        let mut st = self.state.borrow_mut();
        let t = st.last_move_time;
        st.advance_to(t);
        Ok(())
    }

    fn dwell(&mut self, delay: f64) -> HostResult<()> {
        let mut st = self.state.borrow_mut();
        let t = st.flush_time();
        st.last_move_time = t + delay.max(0.0);
        Ok(())
    }

    fn get_last_move_time(&mut self) -> f64 {
        self.state.borrow_mut().flush_time()
    }

    fn flush_step_generation(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn kinematics_status(&self) -> KinematicsStatus {
        self.state.borrow().kinematics()
    }

    fn note_z_not_homed(&mut self) {
        self.state.borrow_mut().homed[2] = false;
    }

    fn commanded_position(&self) -> [f64; 3] {
        self.state.borrow().cmd_pos
    }

    fn max_accel(&self) -> f64 {
        self.state.borrow().max_accel
    }

    fn set_max_accel(&mut self, accel: f64) -> HostResult<()> {
        self.state.borrow_mut().max_accel = accel;
        Ok(())
    }

    fn extruder_status(&self) -> Option<HeaterStatus> {
        Some(self.state.borrow().heater)
    }

    fn set_extruder_target(&mut self, target: f64) -> HostResult<()> {
        self.state.borrow_mut().heater.target = target;
        Ok(())
    }

    fn wait_extruder(&mut self, minimum: Option<f64>, maximum: Option<f64>) -> HostResult<()> {
        let mut st = self.state.borrow_mut();
        if let Some(min) = minimum {
            st.heater.temperature = st.heater.temperature.max(min);
        }
        if let Some(max) = maximum {
            st.heater.temperature = st.heater.temperature.min(max);
        }
        Ok(())
    }
}

impl SimulatedPrinter {
    fn probing_move_inner(
        &mut self,
        endstop: &mut dyn HomingEndstop,
        pos: [f64; 3],
        speed: f64,
    ) -> HostResult<[f64; 3]> {
        endstop.homing_move_begin()?;
        let start = self.state.borrow_mut().flush_time();
        endstop.home_start(start)?;
        let stop = self.state.borrow_mut().run_probe_move(pos, speed);
        let end = self.state.borrow_mut().flush_time();
        let trigger_time = endstop.home_wait(end)?;
        self.state.borrow_mut().advance_to(end);
        if trigger_time == 0.0 {
            return Err(Box::new(HwError::NoTrigger));
        }
        Ok(stop)
    }
}

impl Homing for SimulatedPrinter {
    fn probing_move(
        &mut self,
        endstop: &mut dyn HomingEndstop,
        pos: [f64; 3],
        speed: f64,
    ) -> HostResult<[f64; 3]> {
        if let Some(msg) = self.shutdown_reason() {
            return Err(Box::new(HwError::Shutdown(msg)));
        }
        self.probing_move_inner(endstop, pos, speed)
    }

    fn home_rails(&mut self, endstop: &mut dyn HomingEndstop, axes: &[usize]) -> HostResult<()> {
        if !axes.contains(&2) {
            let mut st = self.state.borrow_mut();
            for &a in axes {
                if let Some(h) = st.homed.get_mut(a) {
                    *h = true;
                }
            }
            return Ok(());
        }
        endstop.home_rails_begin();
        let pe = endstop.position_endstop();
        let (forced, target, speed) = {
            let mut st = self.state.borrow_mut();
            let mut forced = st.cmd_pos;
            forced[2] = pe + 1.5 * (st.cfg.axis_max[2] - pe);
            st.set_position(forced, &[]);
            st.homed[2] = false;
            let mut target = forced;
            target[2] = pe;
            (forced, target, st.cfg.homing_speed)
        };
        tracing::debug!(forced_z = forced[2], pe, "sim homing z");
        let stop = self.probing_move_inner(endstop, target, speed)?;
        let move_time = {
            let mut st = self.state.borrow_mut();
            st.set_position([stop[0], stop[1], pe], axes);
            st.flush_time()
        };
        let mut hs = HomingState::new(axes.to_vec(), move_time);
        endstop.home_rails_end(&mut hs)?;
        let mut st = self.state.borrow_mut();
        let mut pos = st.cmd_pos;
        for (axis, v) in hs.homed_position.iter().enumerate() {
            if let Some(v) = v {
                pos[axis] = *v;
            }
        }
        st.set_position(pos, &[]);
        Ok(())
    }

    fn manual_probe(&mut self) -> HostResult<Option<[f64; 3]>> {
        let mut st = self.state.borrow_mut();
        if st.manual_probe_abort {
            return Ok(None);
        }
        let phys = st.phys_now();
        let z = st.bed_height(phys[0], phys[1]) + st.cfg.paper_thickness + st.offset[2];
        let mut target = st.cmd_pos;
        target[2] = z;
        st.queue_move(target, 5.0);
        let t = st.last_move_time;
        st.advance_to(t);
        Ok(Some(st.cmd_pos))
    }
}

impl TriggerSync for SimulatedPrinter {
    fn mcu_count(&self) -> usize {
        self.state.borrow().cfg.trsync_mcus
    }

    fn oid(&self) -> u8 {
        0
    }

    fn start(&mut self, _print_time: f64, _expire_timeout: f64) -> HostResult<()> {
        self.state.borrow_mut().trsync_reason = reason::HOST_REQUEST;
        Ok(())
    }

    fn dispatch_start(&mut self, _host_reason: u8) {}

    fn set_home_end_time(&mut self, _home_end_time: f64) {}

    fn complete(&mut self) {}

    fn wait(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn dispatch_stop(&mut self) {}

    fn stop(&mut self) -> Vec<u8> {
        let st = self.state.borrow();
        vec![st.trsync_reason; st.cfg.trsync_mcus.max(1)]
    }
}

impl Printer for SimulatedPrinter {
    fn invoke_shutdown(&mut self, msg: &str) {
        let mut st = self.state.borrow_mut();
        tracing::error!(msg, "simulated printer shutdown");
        if st.shutdown.is_none() {
            st.shutdown = Some(msg.to_string());
        }
        st.stream_en = false;
    }

    fn is_shutdown(&self) -> bool {
        self.state.borrow().shutdown.is_some()
    }

    fn respond_info(&mut self, msg: &str) {
        tracing::debug!(target: "console", "{msg}");
        self.state.borrow_mut().console.push(msg.to_string());
    }

    fn respond_raw(&mut self, msg: &str) {
        tracing::debug!(target: "console", "{msg}");
        self.state.borrow_mut().console.push(msg.to_string());
    }

    fn homing_origin_z(&self) -> f64 {
        self.state.borrow().homing_origin_z
    }

    fn bed_leveling(&self) -> Option<BedLeveling> {
        self.state.borrow().bed_leveling.clone()
    }

    fn excluded_objects(&self) -> Option<Vec<Vec<[f64; 2]>>> {
        self.state.borrow().objects.clone()
    }
}

impl ConfigStore for SimulatedPrinter {
    fn set(&mut self, section: &str, key: &str, value: &str) {
        self.state.borrow_mut().pending.set(section, key, value);
    }

    fn remove_section(&mut self, section: &str) {
        self.state.borrow_mut().pending.remove_section(section);
    }
}

impl BedMesh for SimulatedPrinter {
    fn set_mesh(&mut self, mesh: ZMesh) -> HostResult<()> {
        self.state.borrow_mut().mesh = Some(mesh);
        Ok(())
    }

    fn save_profile(&mut self, name: &str) -> HostResult<()> {
        let mut st = self.state.borrow_mut();
        let Some(mesh) = st.mesh.clone() else {
            return Err(format!("no mesh to save as profile '{name}'").into());
        };
        st.profiles.insert(name.to_string(), mesh);
        Ok(())
    }
}

impl TemperatureSource for SimulatedPrinter {
    fn get_temp(&self, _print_time: f64) -> f64 {
        self.state.borrow().cfg.coil_temp
    }
}
