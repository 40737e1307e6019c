use std::time::Duration;

use rstest::rstest;
use scanner_hardware::{HwError, SimConfig, SimulatedPrinter};
use scanner_traits::mcu::reason;
use scanner_traits::{
    HostResult, Homing, HomingEndstop, HomingState, Mcu, McuCommand, SampleFeed, Toolhead,
    TrajectoryQueue, TriggerSync,
};

/// Minimal endstop arming the simulated MCU directly.
struct ArmingEndstop {
    sim: SimulatedPrinter,
    trigger: u32,
    method: u8,
    threshold: u32,
}

impl HomingEndstop for ArmingEndstop {
    fn homing_move_begin(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn home_start(&mut self, _print_time: f64) -> HostResult<()> {
        self.sim.send(McuCommand::SetThreshold {
            trigger: self.trigger,
            untrigger: self.trigger.saturating_sub(100),
        })?;
        self.sim.send(McuCommand::Home {
            trsync_oid: 0,
            trigger_reason: reason::ENDSTOP_HIT,
            trigger_invert: 0,
            threshold: self.threshold,
            trigger_method: self.method,
        })
    }

    fn home_wait(&mut self, home_end_time: f64) -> HostResult<f64> {
        self.sim.send(McuCommand::StopHome)?;
        let reasons = TriggerSync::stop(&mut self.sim);
        Ok(if reasons[0] == reason::ENDSTOP_HIT {
            home_end_time
        } else {
            0.0
        })
    }

    fn query_endstop(&mut self, _print_time: f64) -> HostResult<bool> {
        Ok(false)
    }

    fn position_endstop(&self) -> f64 {
        2.0
    }

    fn home_rails_begin(&mut self) {}

    fn home_rails_end(&mut self, _state: &mut HomingState) -> HostResult<()> {
        Ok(())
    }
}

fn flat_sim() -> SimulatedPrinter {
    SimulatedPrinter::new(SimConfig {
        bed_tilt: [0.0, 0.0],
        ..SimConfig::default()
    })
}

#[test]
fn coil_frequency_falls_with_distance_and_inverts() {
    let cfg = SimConfig::default();
    let near = cfg.coil_freq(0.5, 25.0);
    let far = cfg.coil_freq(4.0, 25.0);
    assert!(near > far);
    assert!((cfg.coil_gap(cfg.coil_freq(2.0, 25.0)) - 2.0).abs() < 1e-9);
    assert_eq!(cfg.sensor_freq(), 24_000_000.0);
}

#[test]
fn feed_is_silent_until_stream_enabled() {
    let mut sim = flat_sim();
    let t0 = sim.now();
    assert!(sim.recv(Duration::from_millis(100)).is_none());
    assert!((sim.now() - t0 - 0.1).abs() < 1e-9);

    sim.send(McuCommand::Stream { en: 1 }).unwrap();
    let a = sim.recv(Duration::from_millis(100)).expect("sample");
    let b = sim.recv(Duration::from_millis(100)).expect("sample");
    let ca = sim.clock32_to_clock64(a.clock);
    let cb = sim.clock32_to_clock64(b.clock);
    let dt = sim.clock_to_print_time(cb) - sim.clock_to_print_time(ca);
    assert!((dt - 0.002).abs() < 1e-6);
    assert_eq!(a.data, b.data);

    sim.send(McuCommand::Stream { en: 0 }).unwrap();
    assert!(sim.recv(Duration::from_millis(10)).is_none());
}

#[test]
fn coil_fault_reports_sentinel() {
    let mut sim = flat_sim();
    sim.send(McuCommand::Stream { en: 1 }).unwrap();
    sim.set_coil_fault(true);
    assert_eq!(sim.recv(Duration::from_millis(10)).unwrap().data, 0x0FFF_FFFF);
}

#[test]
fn scan_probe_stops_at_trigger_gap() {
    let sim = flat_sim();
    let cfg = sim.config();
    let trigger = cfg.freq_to_count(cfg.coil_freq(2.0, 25.0)).round() as u32;
    let mut endstop = ArmingEndstop {
        sim: sim.clone(),
        trigger,
        method: 0,
        threshold: 2500,
    };
    let mut homing = sim.clone();
    let mut pos = sim.get_position();
    pos[2] = -2.0;
    let stop = homing.probing_move(&mut endstop, pos, 5.0).unwrap();
    assert!((stop[2] - 2.0).abs() < 1e-3, "stopped at {}", stop[2]);
    assert!((sim.coil_gap() - 2.0).abs() < 1e-3);
    let mv = sim.extract(sim.now()).expect("move recorded");
    assert!(mv.move_t > 0.0);
}

#[test]
fn probe_without_trigger_reports_full_movement() {
    let sim = flat_sim();
    let mut endstop = ArmingEndstop {
        sim: sim.clone(),
        trigger: u32::MAX,
        method: 0,
        threshold: 2500,
    };
    let mut homing = sim.clone();
    let mut pos = sim.get_position();
    pos[2] = 5.0;
    let err = homing.probing_move(&mut endstop, pos, 5.0).unwrap_err();
    assert!(matches!(err.downcast_ref::<HwError>(), Some(HwError::NoTrigger)));
    assert_eq!(err.to_string(), "No trigger on probe after full movement");
}

#[rstest]
#[case(750)]
#[case(3000)]
fn touch_trigger_is_seeded_and_near_bed(#[case] threshold: u32) {
    let run = || {
        let sim = flat_sim();
        let mut endstop = ArmingEndstop {
            sim: sim.clone(),
            trigger: 0,
            method: 1,
            threshold,
        };
        let mut homing = sim.clone();
        let mut pos = sim.get_position();
        pos[2] = -2.0;
        homing.probing_move(&mut endstop, pos, 3.0).unwrap()[2]
    };
    let a = run();
    let b = run();
    assert_eq!(a, b);
    assert!(a.abs() < 0.2, "touch at {a}");
}

#[test]
fn set_position_shifts_commanded_frame_only() {
    let mut sim = flat_sim();
    let phys = sim.physical_position();
    sim.set_position([phys[0], phys[1], 250.0], &[2]).unwrap();
    assert_eq!(sim.get_position()[2], 250.0);
    assert_eq!(sim.physical_position(), phys);
    assert!(sim.kinematics_status().is_homed('z'));
    sim.manual_move([None, None, Some(245.0)], 5.0).unwrap();
    sim.wait_moves().unwrap();
    assert!((sim.physical_position()[2] - (phys[2] - 5.0)).abs() < 1e-9);
}

#[test]
fn homed_moves_are_range_checked() {
    let mut sim = flat_sim();
    sim.home_z_physical();
    let err = sim.manual_move([None, None, Some(400.0)], 5.0).unwrap_err();
    assert!(err.to_string().contains("Move out of range"));
}

#[test]
fn base_read_reports_erased_block_by_default() {
    let mut sim = flat_sim();
    let base = sim.base_read(6, 0).unwrap();
    let decoded = scanner_hardware::decode_base(&base.bytes).unwrap();
    assert!(!decoded.is_programmed());
}

#[test]
fn replay_source_drains_then_times_out() {
    use scanner_hardware::ReplaySource;
    use scanner_traits::{RawSample, SampleSource};

    let s = RawSample {
        clock: 10,
        data: 1234,
        temp: 900,
    };
    let mut src = ReplaySource::new([s, s]);
    assert_eq!(src.read(Duration::from_millis(1)).unwrap(), Some(s));
    assert_eq!(src.remaining(), 1);
    assert_eq!(src.read(Duration::from_millis(1)).unwrap(), Some(s));
    assert_eq!(src.read(Duration::from_millis(1)).unwrap(), None);

    let mut failing = ReplaySource::new([]).fail_when_drained();
    let err = failing.read(Duration::from_millis(1)).unwrap_err();
    assert!(matches!(err.downcast_ref::<HwError>(), Some(HwError::Timeout)));
}
