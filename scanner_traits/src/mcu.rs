//! Microcontroller link: command encoding surface, raw samples and trsync.

use crate::HostResult;
use std::time::Duration;

/// trsync stop reasons reported by the MCU.
pub mod reason {
    pub const ENDSTOP_HIT: u8 = 1;
    pub const HOST_REQUEST: u8 = 2;
    pub const PAST_END_TIME: u8 = 3;
    pub const COMMS_TIMEOUT: u8 = 4;
}

/// One `<sensor>_data` response as it arrives from the MCU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Low 32 bits of the MCU clock at acquisition.
    pub clock: u32,
    /// Raw frequency count.
    pub data: u32,
    /// Smoothed thermistor ADC accumulator.
    pub temp: u32,
}

/// Commands the driver sends to the sensor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuCommand {
    Stream {
        en: u8,
    },
    SetThreshold {
        trigger: u32,
        untrigger: u32,
    },
    Home {
        trsync_oid: u8,
        trigger_reason: u8,
        trigger_invert: u8,
        threshold: u32,
        trigger_method: u8,
    },
    StopHome,
}

impl McuCommand {
    /// Message name without the sensor prefix.
    pub fn suffix(&self) -> &'static str {
        match self {
            McuCommand::Stream { .. } => "stream",
            McuCommand::SetThreshold { .. } => "set_threshold",
            McuCommand::Home { .. } => "home",
            McuCommand::StopHome => "stop_home",
        }
    }

    /// Message format as registered with the MCU dictionary.
    pub fn format(&self) -> &'static str {
        match self {
            McuCommand::Stream { .. } => "stream en=%u",
            McuCommand::SetThreshold { .. } => "set_threshold trigger=%u untrigger=%u",
            McuCommand::Home { .. } => {
                "home trsync_oid=%c trigger_reason=%c trigger_invert=%c threshold=%u trigger_method=%u"
            }
            McuCommand::StopHome => "stop_home",
        }
    }
}

/// Payload of a `<sensor>_base_read` query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseRead {
    pub bytes: Vec<u8>,
    pub offset: u16,
}

impl BaseRead {
    /// Decode the 6 byte `<IH` block at offset 0; `None` on a short read.
    pub fn calibration(&self) -> Option<BaseCalibration> {
        let [a, b, c, d, e, f] = self.bytes.get(..6)? else {
            return None;
        };
        Some(BaseCalibration {
            f_count: u32::from_le_bytes([*a, *b, *c, *d]),
            adc: u16::from_le_bytes([*e, *f]),
        })
    }
}

/// Frequency count and thermistor ADC stored in the sensor's base block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseCalibration {
    pub f_count: u32,
    pub adc: u16,
}

impl BaseCalibration {
    /// A block is only meaningful when neither field is erased flash.
    pub fn is_programmed(&self) -> bool {
        self.f_count < 0xFFFF_FFFF && self.adc < 0xFFFF
    }
}

/// The sensor MCU as seen by the driver.
pub trait Mcu {
    /// Raw MCU clock frequency in Hz.
    fn clock_freq(&self) -> f64;
    /// `ADC_MAX` constant.
    fn adc_max(&self) -> f64;
    /// `<SENSOR>_ADC_SMOOTH_COUNT` constant.
    fn adc_smooth_count(&self) -> f64;
    fn firmware_version(&self) -> String;
    fn clock32_to_clock64(&self, clock32: u32) -> u64;
    fn clock_to_print_time(&self, clock: u64) -> f64;
    fn print_time_to_clock(&self, print_time: f64) -> u64;
    /// True when the host is writing commands to a file instead of a device.
    fn is_fileoutput(&self) -> bool {
        false
    }
    fn send(&mut self, cmd: McuCommand) -> HostResult<()>;
    fn base_read(&mut self, len: u8, offset: u16) -> HostResult<BaseRead>;
}

/// Hand-off point between the transport and the reactor.
pub trait SampleFeed {
    /// Next raw sample, or `None` if nothing arrived within `timeout`.
    fn recv(&mut self, timeout: Duration) -> Option<RawSample>;
}

/// Blocking producer of raw samples owned by the transport thread.
pub trait SampleSource: Send {
    /// Wait up to `timeout` for the next sample; `Ok(None)` on timeout.
    fn read(&mut self, timeout: Duration) -> HostResult<Option<RawSample>>;
}

/// Host-side trigger synchronisation across the MCUs driving the Z steppers.
pub trait TriggerSync {
    /// Number of MCUs participating in the trigger.
    fn mcu_count(&self) -> usize;
    /// Object id of the trsync owned by the sensor MCU.
    fn oid(&self) -> u8;
    fn start(&mut self, print_time: f64, expire_timeout: f64) -> HostResult<()>;
    fn dispatch_start(&mut self, host_reason: u8);
    fn set_home_end_time(&mut self, home_end_time: f64);
    /// Force completion (file output / dry run).
    fn complete(&mut self);
    /// Block until any participant triggers or expires.
    fn wait(&mut self) -> HostResult<()>;
    fn dispatch_stop(&mut self);
    /// Stop every trsync and return their reasons, sensor MCU first.
    fn stop(&mut self) -> Vec<u8>;
}
