//! Sensor link: sample pump, stream engagement and synchronous sampling.
//!
//! `Sensor` owns every host collaborator except the homing module, so the
//! endstop can borrow it mutably while homing drives a move. Samples are
//! only processed inside [`Sensor::pump`], on the caller's thread, in the
//! order the feed delivered them.

use std::time::{Duration, Instant};

use scanner_traits::{
    AxisTwist, Clock, ConfigStore, Mcu, McuCommand, Printer, RawSample, SampleFeed,
    TemperatureSource, Toolhead, TrajectoryQueue, TriggerSync,
};

use crate::config::{ProbeMode, SensorSettings};
use crate::endstop::EndstopPhase;
use crate::enrich::{EnrichContext, Notice, SampleEnricher};
use crate::error::{Result, ScannerError, fail};
use crate::hw_error::host;
use crate::mode::TriggerMode;
use crate::model::{ModelRegistry, ScannerModel};
use crate::sample::Sample;
use crate::session::{CompletionCallback, SampleCallback, SessionId, Sessions, collector};
use crate::stream::{STREAM_TIMEOUT, StreamBuffer};
use crate::util::median;

/// Longest single wait on the feed before housekeeping runs.
pub const PUMP_TIMEOUT: Duration = Duration::from_millis(50);

pub const STREAM_TIMEOUT_MSG: &str = "Scanner sensor not receiving data";

/// Host collaborators owned by the sensor.
pub struct SensorLinks {
    pub mcu: Box<dyn Mcu>,
    pub feed: Box<dyn SampleFeed>,
    pub trapq: Box<dyn TrajectoryQueue>,
    pub toolhead: Box<dyn Toolhead>,
    pub trsync: Box<dyn TriggerSync>,
    pub printer: Box<dyn Printer>,
    pub store: Box<dyn ConfigStore>,
    pub temp_override: Option<Box<dyn TemperatureSource>>,
    pub axis_twist: Option<Box<dyn AxisTwist>>,
    pub clock: Box<dyn Clock>,
}

pub struct Sensor {
    pub(crate) settings: SensorSettings,
    pub(crate) mcu: Box<dyn Mcu>,
    feed: Box<dyn SampleFeed>,
    trapq: Box<dyn TrajectoryQueue>,
    pub(crate) toolhead: Box<dyn Toolhead>,
    pub(crate) trsync: Box<dyn TriggerSync>,
    pub(crate) printer: Box<dyn Printer>,
    pub(crate) store: Box<dyn ConfigStore>,
    temp_override: Option<Box<dyn TemperatureSource>>,
    axis_twist: Option<Box<dyn AxisTwist>>,
    clock: Box<dyn Clock>,
    pub(crate) enricher: SampleEnricher,
    buffer: StreamBuffer,
    sessions: Sessions,
    engaged: usize,
    last_rx: Instant,
    last_raw_clock: u64,
    pub(crate) models: ModelRegistry,
    /// Configured operating mode; models are validated against it.
    pub(crate) probe_mode: ProbeMode,
    pub(crate) trigger: TriggerMode,
    /// Detect threshold sent with every home command.
    pub(crate) detect_threshold: u32,
    pub(crate) trigger_freq: Option<f64>,
    pub(crate) untrigger_freq: Option<f64>,
    pub(crate) last_sample: Option<Sample>,
    last_received: Option<Sample>,
    pub(crate) phase: EndstopPhase,
    pub(crate) is_homing: bool,
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("name", &self.settings.name)
            .field("engaged", &self.engaged)
            .field("trigger", &self.trigger)
            .field("phase", &self.phase)
            .field("model", &self.models.active().map(|m| m.name.clone()))
            .finish_non_exhaustive()
    }
}

impl Sensor {
    pub fn new(
        links: SensorLinks,
        settings: SensorSettings,
        enricher: SampleEnricher,
        models: ModelRegistry,
        probe_mode: ProbeMode,
        detect_threshold: u32,
    ) -> Self {
        let last_rx = links.clock.now();
        Self {
            settings,
            mcu: links.mcu,
            feed: links.feed,
            trapq: links.trapq,
            toolhead: links.toolhead,
            trsync: links.trsync,
            printer: links.printer,
            store: links.store,
            temp_override: links.temp_override,
            axis_twist: links.axis_twist,
            clock: links.clock,
            enricher,
            buffer: StreamBuffer::new(),
            sessions: Sessions::default(),
            engaged: 0,
            last_rx,
            last_raw_clock: 0,
            models,
            probe_mode,
            trigger: TriggerMode::default(),
            detect_threshold,
            trigger_freq: None,
            untrigger_freq: None,
            last_sample: None,
            last_received: None,
            phase: EndstopPhase::Idle,
            is_homing: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn model(&self) -> Option<std::sync::Arc<ScannerModel>> {
        self.models.active()
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger
    }

    pub fn engaged(&self) -> usize {
        self.engaged
    }

    pub fn last_sample(&self) -> Option<&Sample> {
        self.last_sample.as_ref()
    }

    /// Last processed sample; `dist` is cleared when it was not finite.
    pub fn last_received(&self) -> Option<&Sample> {
        self.last_received.as_ref()
    }

    pub fn respond_info(&mut self, msg: &str) {
        self.printer.respond_info(msg);
    }

    /// Console error line, host style.
    pub fn respond_error(&mut self, msg: &str) {
        self.printer.respond_raw(&format!("!! {msg}\n"));
    }

    pub(crate) fn check_shutdown(&self) -> Result<()> {
        if self.printer.is_shutdown() {
            return Err(fail(ScannerError::Shutdown("Printer is shutdown".into())));
        }
        Ok(())
    }

    // ── Engagement ───────────────────────────────────────────────────────

    /// Count one more stream user; enables the MCU stream on 0 → 1.
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.engaged == 0 {
            host(self.mcu.send(McuCommand::Stream { en: 1 }))?;
            self.last_rx = self.clock.now();
            tracing::debug!(sensor = %self.settings.name, "stream enabled");
        }
        self.engaged += 1;
        self.enricher.reset_filter();
        Ok(())
    }

    /// Drop one stream user; disables the MCU stream on 1 → 0.
    pub fn stop_streaming(&mut self) -> Result<()> {
        let Some(remaining) = self.engaged.checked_sub(1) else {
            tracing::warn!("stop_streaming without a matching start");
            return Ok(());
        };
        self.engaged = remaining;
        let sent = if remaining == 0 {
            tracing::debug!(sensor = %self.settings.name, "stream disabled");
            host(self.mcu.send(McuCommand::Stream { en: 0 }))
        } else {
            Ok(())
        };
        let pending = self.buffer.drain();
        if !pending.is_empty() {
            self.process(pending)?;
        }
        sent
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Register a subscriber and engage the stream.
    pub fn acquire(
        &mut self,
        callback: SampleCallback,
        latency: Option<usize>,
        on_release: Option<CompletionCallback>,
    ) -> Result<SessionId> {
        let key = latency.map(|l| self.buffer.request_latency(l));
        let id = self.sessions.insert(callback, key, on_release);
        if let Err(e) = self.start_streaming() {
            if let Some(released) = self.sessions.remove(id) {
                if let Some(key) = released.latency {
                    self.buffer.drop_latency(key);
                }
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Undo `acquire`; unknown ids are ignored.
    pub fn release(&mut self, id: SessionId) -> Result<()> {
        let Some(released) = self.sessions.remove(id) else {
            return Ok(());
        };
        if let Some(key) = released.latency {
            self.buffer.drop_latency(key);
        }
        let stopped = self.stop_streaming();
        if let Some(done) = released.on_release {
            done();
        }
        stopped
    }

    pub fn session_active(&self, id: SessionId) -> bool {
        self.sessions.contains(id)
    }

    /// Pump until the session stops asking for samples.
    pub fn wait_session(&mut self, id: SessionId) -> Result<()> {
        while !self.sessions.is_done(id) {
            self.check_shutdown()?;
            self.pump(PUMP_TIMEOUT)?;
        }
        Ok(())
    }

    /// Keep `total` samples taken at or after `min_clock`.
    pub fn collect(&mut self, total: usize, min_clock: u64) -> Result<Vec<Sample>> {
        let (callback, sink) = collector(total, min_clock);
        let id = self.acquire(callback, Some(total), None)?;
        let waited = self.wait_session(id);
        let released = self.release(id);
        waited?;
        released?;
        Ok(std::mem::take(&mut *sink.borrow_mut()))
    }

    /// `count` samples taken after all queued moves, skipping `skip` first.
    pub fn sample_printtime_sync(&mut self, skip: usize, count: usize) -> Result<Vec<Sample>> {
        let move_time = self.toolhead.get_last_move_time();
        let settle_clock = self.mcu.print_time_to_clock(move_time);
        let mut samples = self.collect(skip + count, settle_clock)?;
        Ok(samples.split_off(skip.min(samples.len())))
    }

    /// Median distance of a synchronous batch.
    pub fn sample(&mut self, skip: usize, count: usize) -> Result<(f64, Vec<Sample>)> {
        let samples = self.sample_printtime_sync(skip, count)?;
        let dists = samples
            .iter()
            .map(|s| s.dist.ok_or_else(|| fail(ScannerError::probe("No Scanner model loaded"))))
            .collect::<Result<Vec<f64>>>()?;
        Ok((median(&dists), samples))
    }

    /// Next sample, whatever the planner is doing.
    pub fn sample_async(&mut self) -> Result<Sample> {
        self.collect(1, 0)?
            .into_iter()
            .next()
            .ok_or_else(|| fail(ScannerError::Timeout))
    }

    // ── Pump ─────────────────────────────────────────────────────────────

    /// Wait up to `timeout` for one raw sample and flush per buffer policy.
    ///
    /// A silent feed while engaged for longer than the stream timeout shuts
    /// the printer down.
    pub fn pump(&mut self, timeout: Duration) -> Result<()> {
        if let Some(raw) = self.feed.recv(timeout) {
            self.last_rx = self.clock.now();
            self.last_raw_clock = self.mcu.clock32_to_clock64(raw.clock);
            self.buffer.push(raw);
            if let Some(batch) = self.buffer.take_batch(self.engaged > 0) {
                self.process(batch)?;
            }
            return Ok(());
        }
        let pending = self.buffer.drain();
        if !pending.is_empty() {
            self.process(pending)?;
        }
        if self.engaged > 0 && self.clock.secs_since(self.last_rx) >= STREAM_TIMEOUT {
            tracing::error!(sensor = %self.settings.name, "{STREAM_TIMEOUT_MSG}");
            self.printer.invoke_shutdown(STREAM_TIMEOUT_MSG);
            return Err(fail(ScannerError::HardwareFault(STREAM_TIMEOUT_MSG.into())));
        }
        Ok(())
    }

    /// Pump for `secs` of clock time.
    pub fn idle(&mut self, secs: f64) -> Result<()> {
        let start = self.clock.now();
        while self.clock.secs_since(start) < secs {
            self.pump(PUMP_TIMEOUT)?;
        }
        Ok(())
    }

    /// Wait for the planner, then for every sample up to the end of the
    /// last move to be delivered.
    pub fn wait_moves(&mut self) -> Result<()> {
        host(self.toolhead.wait_moves())?;
        if self.engaged == 0 {
            return Ok(());
        }
        let end_clock = self.mcu.print_time_to_clock(self.toolhead.get_last_move_time());
        while self.last_raw_clock < end_clock {
            self.check_shutdown()?;
            self.pump(PUMP_TIMEOUT)?;
        }
        let pending = self.buffer.drain();
        if !pending.is_empty() {
            self.process(pending)?;
        }
        Ok(())
    }

    fn process(&mut self, batch: Vec<RawSample>) -> Result<()> {
        let model = self.models.active();
        let streaming = self.engaged > 0;
        let mut escalated = None;
        let mut last = None;
        for raw in batch {
            let (sample, notices) = {
                let ctx = EnrichContext {
                    mcu: self.mcu.as_ref(),
                    trapq: self.trapq.as_ref(),
                    temp_override: self.temp_override.as_deref(),
                    axis_twist: self.axis_twist.as_deref(),
                    model: model.as_deref(),
                    streaming,
                };
                self.enricher.enrich(raw, &ctx)
            };
            for notice in notices {
                if let Some(err) = self.handle_notice(notice, streaming) {
                    escalated.get_or_insert(err);
                }
            }
            self.sessions.deliver(&sample);
            last = Some(sample);
        }
        if let Some(mut last) = last {
            if !last.dist.is_some_and(f64::is_finite) {
                last.dist = None;
            }
            self.last_received = Some(last);
        }
        escalated.map_or(Ok(()), |e| Err(fail(e)))
    }

    fn handle_notice(&mut self, notice: Notice, streaming: bool) -> Option<ScannerError> {
        match notice {
            Notice::TempSensorFaulty { temp, announce } => {
                if announce {
                    self.respond_error(&format!(
                        "Scanner temperature sensor faulty(read {temp:.2} C), disabling temperature compensation"
                    ));
                }
                None
            }
            Notice::HardwareFault { msg, first } => {
                if streaming {
                    self.printer.invoke_shutdown(&msg);
                    Some(ScannerError::HardwareFault(msg))
                } else {
                    if first {
                        self.respond_error(&msg);
                    }
                    None
                }
            }
        }
    }

    // ── Thresholds ───────────────────────────────────────────────────────

    /// Recompute trigger frequencies for the active model and temperature.
    pub fn update_thresholds(&mut self) -> Result<()> {
        let Some(model) = self.models.active() else {
            self.trigger_freq = None;
            self.untrigger_freq = None;
            return Ok(());
        };
        let trigger = model.dist_to_freq(
            self.settings.trigger_distance,
            self.enricher.last_temp(),
            self.enricher.tempco(),
        )?;
        self.trigger_freq = Some(trigger);
        self.untrigger_freq = Some(trigger * (1.0 - self.settings.trigger_hysteresis));
        Ok(())
    }

    /// Recompute and program the MCU trigger thresholds.
    pub fn apply_threshold(&mut self) -> Result<()> {
        self.update_thresholds()?;
        let (Some(trigger), Some(untrigger)) = (self.trigger_freq, self.untrigger_freq) else {
            return Ok(());
        };
        let cmd = McuCommand::SetThreshold {
            trigger: self.enricher.freq_to_count(trigger) as u32,
            untrigger: self.enricher.freq_to_count(untrigger) as u32,
        };
        tracing::debug!(trigger, untrigger, "thresholds applied");
        host(self.mcu.send(cmd))
    }

    /// Distance for `freq` with the active model, `None` without one.
    pub fn freq_to_dist(&self, freq: f64, temp: f64) -> Option<f64> {
        self.models
            .active()
            .map(|m| m.freq_to_dist(freq, temp, self.enricher.tempco()))
    }

    /// Refuse to go on without a usable active model.
    pub fn validate_model_loaded(&self) -> Result<std::sync::Arc<ScannerModel>> {
        let Some(model) = self.models.active() else {
            return Err(fail(ScannerError::calibration(format!(
                "No model currently selected - make sure you have run {} first. Click <a href='https://docs.cartographer3d.com/cartographer-probe/installation-and-setup/installation/calibration'>HERE</a> for more information",
                crate::util::format_macro(&format!("{}_CALIBRATE", self.settings.name.to_uppercase()))
            ))));
        };
        model.validate(&self.mcu.firmware_version(), self.probe_mode.as_str())?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AlphaBetaFilter;
    use crate::mocks::{MockMcu, NoMotion, ScriptedFeed};
    use scanner_config::PendingConfig;
    use scanner_traits::{ManualClock, McuCommand};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct Console {
        lines: Rc<RefCell<Vec<String>>>,
        shutdown: Rc<RefCell<Option<String>>>,
    }

    impl Printer for Console {
        fn invoke_shutdown(&mut self, msg: &str) {
            self.shutdown.borrow_mut().get_or_insert_with(|| msg.to_string());
        }
        fn is_shutdown(&self) -> bool {
            self.shutdown.borrow().is_some()
        }
        fn respond_info(&mut self, msg: &str) {
            self.lines.borrow_mut().push(msg.to_string());
        }
        fn respond_raw(&mut self, msg: &str) {
            self.lines.borrow_mut().push(msg.to_string());
        }
    }

    struct Idle;

    impl Toolhead for Idle {
        fn get_position(&self) -> [f64; 3] {
            [0.0; 3]
        }
        fn manual_move(&mut self, _: [Option<f64>; 3], _: f64) -> scanner_traits::HostResult<()> {
            Ok(())
        }
        fn set_position(&mut self, _: [f64; 3], _: &[usize]) -> scanner_traits::HostResult<()> {
            Ok(())
        }
        fn wait_moves(&mut self) -> scanner_traits::HostResult<()> {
            Ok(())
        }
        fn dwell(&mut self, _: f64) -> scanner_traits::HostResult<()> {
            Ok(())
        }
        fn get_last_move_time(&mut self) -> f64 {
            0.0
        }
        fn flush_step_generation(&mut self) -> scanner_traits::HostResult<()> {
            Ok(())
        }
        fn kinematics_status(&self) -> scanner_traits::KinematicsStatus {
            scanner_traits::KinematicsStatus {
                homed_axes: String::new(),
                axis_minimum: [0.0; 3],
                axis_maximum: [200.0; 3],
            }
        }
        fn note_z_not_homed(&mut self) {}
        fn commanded_position(&self) -> [f64; 3] {
            [0.0; 3]
        }
        fn max_accel(&self) -> f64 {
            1000.0
        }
        fn set_max_accel(&mut self, _: f64) -> scanner_traits::HostResult<()> {
            Ok(())
        }
    }

    struct NoSync;

    impl TriggerSync for NoSync {
        fn mcu_count(&self) -> usize {
            1
        }
        fn oid(&self) -> u8 {
            0
        }
        fn start(&mut self, _: f64, _: f64) -> scanner_traits::HostResult<()> {
            Ok(())
        }
        fn dispatch_start(&mut self, _: u8) {}
        fn set_home_end_time(&mut self, _: f64) {}
        fn complete(&mut self) {}
        fn wait(&mut self) -> scanner_traits::HostResult<()> {
            Ok(())
        }
        fn dispatch_stop(&mut self) {}
        fn stop(&mut self) -> Vec<u8> {
            vec![scanner_traits::mcu::reason::PAST_END_TIME]
        }
    }

    fn raw(clock: u32, data: u32) -> RawSample {
        RawSample {
            clock,
            data,
            temp: 30_000,
        }
    }

    fn sensor(feed: ScriptedFeed, clock: ManualClock) -> (Sensor, crate::mocks::CommandLog, Console) {
        let (mcu, log) = MockMcu::new(48_000_000.0);
        let console = Console::default();
        let enricher = SampleEnricher::new(AlphaBetaFilter::new(1.0, 0.0), &mcu);
        let links = SensorLinks {
            mcu: Box::new(mcu),
            feed: Box::new(feed),
            trapq: Box::new(NoMotion),
            toolhead: Box::new(Idle),
            trsync: Box::new(NoSync),
            printer: Box::new(console.clone()),
            store: Box::new(PendingConfig::new()),
            temp_override: None,
            axis_twist: None,
            clock: Box::new(clock),
        };
        let s = Sensor::new(
            links,
            SensorSettings::default(),
            enricher,
            ModelRegistry::default(),
            ProbeMode::Scan,
            2500,
        );
        (s, log, console)
    }

    fn streams(log: &crate::mocks::CommandLog) -> Vec<u8> {
        log.borrow()
            .iter()
            .filter_map(|c| match c {
                McuCommand::Stream { en } => Some(*en),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn nested_sessions_toggle_stream_once() {
        let (mut s, log, _) = sensor(ScriptedFeed::default(), ManualClock::new());
        let a = s.acquire(Box::new(|_| crate::Flow::Continue), None, None).unwrap();
        let b = s.acquire(Box::new(|_| crate::Flow::Continue), Some(5), None).unwrap();
        let c = s.acquire(Box::new(|_| crate::Flow::Continue), None, None).unwrap();
        s.release(b).unwrap();
        s.release(a).unwrap();
        assert_eq!(streams(&log), [1]);
        s.release(c).unwrap();
        s.release(c).unwrap();
        assert_eq!(streams(&log), [1, 0]);
        assert_eq!(s.engaged(), 0);
    }

    #[test]
    fn collect_skips_and_counts() {
        let feed = ScriptedFeed::new((1..=20).map(|i| raw(i * 96_000, 30_000_000 + i)));
        let (mut s, log, _) = sensor(feed, ManualClock::new());
        let samples = s.collect(3, 4 * 96_000).unwrap();
        let clocks: Vec<u64> = samples.iter().map(|x| x.clock).collect();
        assert_eq!(clocks, [4 * 96_000, 5 * 96_000, 6 * 96_000]);
        assert_eq!(streams(&log), [1, 0]);
        // The batch holding the last kept sample may carry later ones too.
        let last = s.last_received().map(|x| x.clock).unwrap();
        assert!(last >= 6 * 96_000, "{last}");
    }

    #[test]
    fn silent_feed_times_out_with_shutdown() {
        let clock = ManualClock::new();
        let (mut s, _, console) = sensor(ScriptedFeed::default(), clock.clone());
        s.start_streaming().unwrap();
        s.pump(PUMP_TIMEOUT).unwrap();
        clock.advance(Duration::from_secs(3));
        let err = s.pump(PUMP_TIMEOUT).unwrap_err();
        assert_eq!(err.to_string(), STREAM_TIMEOUT_MSG);
        assert_eq!(console.shutdown.borrow().as_deref(), Some(STREAM_TIMEOUT_MSG));
    }

    #[test]
    fn coil_fault_while_streaming_shuts_down() {
        let feed = ScriptedFeed::new([raw(100, crate::enrich::SHORTED_COIL), raw(200, 30_000_000)]);
        let (mut s, _, console) = sensor(feed, ManualClock::new());
        let err = s.collect(2, 0).unwrap_err();
        assert!(err.to_string().contains("coil is shorted"));
        assert!(console.shutdown.borrow().is_some());
        assert_eq!(s.engaged(), 0);
    }

    #[test]
    fn idle_fault_is_a_warning() {
        let feed = ScriptedFeed::new([raw(100, crate::enrich::SHORTED_COIL)]);
        let (mut s, _, console) = sensor(feed, ManualClock::new());
        s.pump(PUMP_TIMEOUT).unwrap();
        assert!(console.shutdown.borrow().is_none());
        assert_eq!(
            console.lines.borrow().as_slice(),
            ["!! Scanner hardware issue: coil is shorted or not connected\n"]
        );
    }
}
