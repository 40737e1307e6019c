//! Test and helper mocks for scanner_core

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use scanner_traits::{
    AxisTwist, BaseRead, HostResult, Mcu, McuCommand, RawSample, SampleFeed, TrajectoryQueue,
    TrapMove,
};

/// Commands recorded by a [`MockMcu`].
pub type CommandLog = Rc<RefCell<Vec<McuCommand>>>;

/// MCU with identity clock extension and a recording command queue.
///
/// Print time is `clock / clock_freq`; the base block is erased flash unless
/// set with [`MockMcu::with_base`].
#[derive(Debug, Clone)]
pub struct MockMcu {
    freq: f64,
    log: CommandLog,
    base: Vec<u8>,
    firmware: String,
}

impl MockMcu {
    pub fn new(freq: f64) -> (Self, CommandLog) {
        let log: CommandLog = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                freq,
                log: Rc::clone(&log),
                base: vec![0xFF; 6],
                firmware: "CARTOGRAPHER 5.1.0".to_string(),
            },
            log,
        )
    }

    #[must_use]
    pub fn with_base(mut self, bytes: Vec<u8>) -> Self {
        self.base = bytes;
        self
    }
}

impl Mcu for MockMcu {
    fn clock_freq(&self) -> f64 {
        self.freq
    }

    fn adc_max(&self) -> f64 {
        4095.0
    }

    fn adc_smooth_count(&self) -> f64 {
        16.0
    }

    fn firmware_version(&self) -> String {
        self.firmware.clone()
    }

    fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        u64::from(clock32)
    }

    fn clock_to_print_time(&self, clock: u64) -> f64 {
        clock as f64 / self.freq
    }

    fn print_time_to_clock(&self, print_time: f64) -> u64 {
        (print_time * self.freq).max(0.0) as u64
    }

    fn send(&mut self, cmd: McuCommand) -> HostResult<()> {
        self.log.borrow_mut().push(cmd);
        Ok(())
    }

    fn base_read(&mut self, len: u8, offset: u16) -> HostResult<BaseRead> {
        let mut bytes = self.base.clone();
        bytes.resize(usize::from(len), 0xFF);
        Ok(BaseRead { bytes, offset })
    }
}

/// Trajectory queue with no history.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMotion;

impl TrajectoryQueue for NoMotion {
    fn extract(&self, _print_time: f64) -> Option<TrapMove> {
        None
    }
}

/// Toolhead parked at a fixed position for all time.
#[derive(Debug, Clone, Copy)]
pub struct FixedTrapq(pub [f64; 3]);

impl TrajectoryQueue for FixedTrapq {
    fn extract(&self, _print_time: f64) -> Option<TrapMove> {
        Some(TrapMove {
            print_time: 0.0,
            move_t: 0.0,
            start_v: 0.0,
            accel: 0.0,
            start_pos: self.0,
            axes_r: [0.0; 3],
        })
    }
}

/// Same twist correction everywhere.
#[derive(Debug, Clone, Copy)]
pub struct ConstantTwist(pub f64);

impl AxisTwist for ConstantTwist {
    fn z_compensation(&self, _pos: [f64; 3]) -> f64 {
        self.0
    }
}

/// Feed handing out a fixed list of samples, then timing out.
#[derive(Debug, Default, Clone)]
pub struct ScriptedFeed {
    samples: VecDeque<RawSample>,
}

impl ScriptedFeed {
    pub fn new(samples: impl IntoIterator<Item = RawSample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
        }
    }
}

impl SampleFeed for ScriptedFeed {
    fn recv(&mut self, _timeout: Duration) -> Option<RawSample> {
        self.samples.pop_front()
    }
}
