//! Scan model calibration: a slow descent from `ceil` to `floor` with the
//! stream engaged, fitted as a degree-9 polynomial of Z over `1/freq`.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Serialize;

use crate::commands::{Bounds, CommandParams};
use crate::config::ProbeMode;
use crate::error::{Result, ScannerError, fail};
use crate::hw_error::host;
use crate::model::{ScannerModel, save_message};
use crate::polynomial::Polynomial;
use crate::sample::Sample;
use crate::scanner::Scanner;
use crate::session::{Flow, SampleCallback};
use crate::util::median;

pub const POLY_DEGREE: usize = 9;
/// Samples taken before and after the descent.
const SETTLE_SAMPLES: usize = 50;
const SETTLE_DWELL: f64 = 0.25;
const TOUCH_LOCATION_SPEED: f64 = 40.0;
/// Clearance below the Z limit when calibrating without a homed Z.
const FORCED_Z_MARGIN: f64 = 2.0;

/// One row of the calibration curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationPoint {
    pub freq: f64,
    pub z: f64,
    pub temp: f64,
}

impl From<scanner_config::CalibrationRow> for CalibrationPoint {
    fn from(r: scanner_config::CalibrationRow) -> Self {
        Self {
            freq: r.freq,
            z: r.z,
            temp: r.temp,
        }
    }
}

/// Fit a model to a calibration curve.
///
/// Points with a non-positive frequency or a non-finite Z are ignored.
pub fn fit_model(
    name: &str,
    points: &[CalibrationPoint],
    mode: ProbeMode,
    fw_version: &str,
) -> Result<ScannerModel> {
    let usable: Vec<&CalibrationPoint> = points
        .iter()
        .filter(|p| p.freq.is_finite() && p.freq > 0.0 && p.z.is_finite())
        .collect();
    let inv_freq: Vec<f64> = usable.iter().map(|p| 1.0 / p.freq).collect();
    let z: Vec<f64> = usable.iter().map(|p| p.z).collect();
    let temps: Vec<f64> = usable.iter().map(|p| p.temp).collect();
    let poly = Polynomial::fit(&inv_freq, &z, POLY_DEGREE)?;
    Ok(ScannerModel {
        name: name.to_string(),
        poly,
        temp: median(&temps),
        min_z: z.iter().copied().fold(f64::INFINITY, f64::min),
        max_z: z.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        offset: 0.0,
        mode: mode.as_str().to_string(),
        fw_version: fw_version.to_string(),
    })
}

/// Write `freq,z,temp` rows to `scanner-calibrate-<timestamp>.csv` in `dir`.
pub fn write_dump(dir: &Path, points: &[CalibrationPoint]) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("scanner-calibrate-{stamp}.csv"));
    let mut w = csv::Writer::from_path(&path)?;
    w.write_record(["freq", "z", "temp"])?;
    for p in points {
        w.write_record([
            format!("{:.5}", p.freq),
            format!("{:.5}", p.z),
            format!("{:.3}", p.temp),
        ])?;
    }
    w.flush()?;
    Ok(path)
}

impl Scanner {
    /// Entry point of `<SENSOR>_CALIBRATE`, also reached from `TOUCH METHOD=manual`.
    pub(crate) fn start_calibration(&mut self, p: &CommandParams) -> Result<()> {
        let nozzle_z = p.float("NOZZLE_Z", self.calibration.nozzle_z, Bounds::none())?;
        let location = [
            p.float("TOUCH_LOCATION_X", self.touch.location[0], Bounds::none())?,
            p.float("TOUCH_LOCATION_Y", self.touch.location[1], Bounds::none())?,
        ];
        let allow_faulty = p.flag("ALLOW_FAULTY_COORDINATE", false)?;
        let method = p.get_or("METHOD", "manual").to_lowercase();

        if self.sensor.probe_mode == ProbeMode::Touch && method != "manual" {
            return self.calibrate_from_touch(p, location, allow_faulty);
        }

        if p.contains("SKIP_MANUAL_PROBE") {
            let kin_pos = self.sensor.toolhead.commanded_position();
            self.check_calibration_area(kin_pos, allow_faulty)?;
            return self.calibrate_sweep(p, kin_pos, Some(nozzle_z), false);
        }

        let kin = self.kinematics();
        if !kin.is_homed('x') || !kin.is_homed('y') {
            return Err(fail(ScannerError::calibration(
                "Must home X and Y before calibration",
            )));
        }
        self.check_calibration_area(self.position(), allow_faulty)?;

        let forced_z = !kin.is_homed('z');
        if forced_z {
            self.sensor.toolhead.get_last_move_time();
            let ceil = p.float("CEIL", self.calibration.ceil, Bounds::none())?;
            let mut pos = self.position();
            pos[2] = kin.axis_maximum[2] - FORCED_Z_MARGIN - ceil;
            self.set_position(pos, &[2])?;
        }
        self.move_to([Some(location[0]), Some(location[1]), None], TOUCH_LOCATION_SPEED)?;
        self.wait_moves()?;

        match host(self.homing.manual_probe())? {
            Some(kin_pos) => self.calibrate_sweep(p, kin_pos, None, true),
            None => {
                self.respond("Manual probe aborted");
                self.sensor.trigger = self.sensor.trigger.reset();
                self.zhop()?;
                if forced_z {
                    self.sensor.toolhead.note_z_not_homed();
                }
                Ok(())
            }
        }
    }

    /// Nozzle contact at the touch location defines Z=0 for the sweep.
    fn calibrate_from_touch(
        &mut self,
        p: &CommandParams,
        location: [f64; 2],
        allow_faulty: bool,
    ) -> Result<()> {
        let kin = self.kinematics();
        if !kin.is_homed('x') || !kin.is_homed('y') {
            return Err(fail(ScannerError::calibration(
                "Must home X and Y before calibration",
            )));
        }
        self.move_to([Some(location[0]), Some(location[1]), None], TOUCH_LOCATION_SPEED)?;
        self.wait_moves()?;
        let mut start = self.position();
        start[2] = kin.axis_maximum[2];
        self.set_position(start, &[2])?;

        let speed = self.probe.probe_speed;
        self.sensor.trigger = self.sensor.trigger.enter_touch(self.sensor.detect_threshold);
        let contact = self.touch_probe(speed, false, false);
        self.sensor.trigger = self.sensor.trigger.reset();
        let contact = match contact {
            Ok(pos) => pos,
            Err(e) => {
                self.sensor.toolhead.note_z_not_homed();
                return Err(e);
            }
        };
        self.check_calibration_area(contact, allow_faulty)?;
        self.calibrate_sweep(p, contact, Some(0.0), false)
    }

    fn check_calibration_area(&mut self, pos: [f64; 3], allow_faulty: bool) -> Result<()> {
        if !self.is_faulty(pos[0], pos[1], false) {
            return Ok(());
        }
        let msg = "Calibrating within a faulty area";
        if !allow_faulty {
            return Err(fail(ScannerError::calibration(msg)));
        }
        self.sensor.respond_error(msg);
        Ok(())
    }

    /// Sweep, fit, save and activate a model.
    ///
    /// `manual` means `kin_pos` is the paper-test position and Z stays as
    /// homed; otherwise the current Z is redefined as `nozzle_z` first.
    pub(crate) fn calibrate_sweep(
        &mut self,
        p: &CommandParams,
        kin_pos: [f64; 3],
        nozzle_z: Option<f64>,
        manual: bool,
    ) -> Result<()> {
        self.respond("Scanner calibration starting");
        let cal = self.calibration.clone();
        let floor = p.float("FLOOR", cal.floor, Bounds::none())?;
        let ceil = p.float("CEIL", cal.ceil, Bounds::none())?;
        let speed = p.float("SPEED", cal.speed, Bounds::none().above(0.0))?;
        let move_speed = p.float("MOVE_SPEED", cal.move_speed, Bounds::none().above(0.0))?;
        let model_name = p.get_or("MODEL_NAME", &cal.default_model_name).to_string();
        self.wait_moves()?;

        let (cal_min, cal_max) = if manual {
            let nozzle_z = p.float("NOZZLE_Z", cal.nozzle_z, Bounds::none())?;
            (kin_pos[2] - nozzle_z + floor, kin_pos[2] - nozzle_z + ceil)
        } else {
            let Some(nozzle_z) = nozzle_z else {
                return Err(fail(ScannerError::State(
                    "calibration without a nozzle Z needs a manual probe".into(),
                )));
            };
            let mut pos = self.position();
            pos[2] = nozzle_z;
            self.set_position(pos, &[])?;
            (floor, ceil)
        };

        let pos = self.position();
        let xy = [pos[0] - self.probe.x_offset, pos[1] - self.probe.y_offset];
        let backlash = self.probe.backlash_comp;
        self.move_to([Some(xy[0]), Some(xy[1]), Some(cal_max + backlash)], move_speed)?;
        self.move_to([None, None, Some(cal_max)], move_speed)?;
        self.wait_moves()?;

        let samples = match self.record_descent(cal_min, speed) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "calibration sweep failed");
                self.sensor.trigger = self.sensor.trigger.reset();
                self.zhop()?;
                return Err(e);
            }
        };

        let baseline = if manual { cal_min } else { 0.0 };
        let points: Vec<CalibrationPoint> = samples
            .iter()
            .filter_map(|s| {
                s.pos.map(|pos| CalibrationPoint {
                    freq: s.freq,
                    z: pos[2] - baseline + floor,
                    temp: s.temp,
                })
            })
            .collect();
        tracing::info!(points = points.len(), cal_min, cal_max, "calibration sweep recorded");

        let fw_version = self.sensor.mcu.firmware_version();
        let model = fit_model(&model_name, &points, self.sensor.probe_mode, &fw_version)?;
        let temp = model.temp;
        model.save(self.sensor.store.as_mut(), self.sensor.probe_mode.as_str());
        self.sensor.models.register(model);
        self.respond(&save_message(&model_name));
        self.sensor.apply_threshold()?;

        self.sensor.toolhead.get_last_move_time();
        let mut end = self.position();
        end[2] = floor;
        self.set_position(end, &[])?;

        if let Some(dir) = cal.dump_dir.as_deref() {
            match write_dump(dir, &points) {
                Ok(path) => tracing::info!(path = %path.display(), "calibration curve written"),
                Err(e) => tracing::warn!(error = %e, "could not write calibration curve"),
            }
        }

        self.respond(&format!(
            "Scanner calibrated at {:.3},{:.3} from {cal_min:.3} to {cal_max:.3}, speed {speed:.2} mm/s, temp {temp:.2}C",
            end[0], end[1]
        ));
        self.sensor.trigger = self.sensor.trigger.reset();
        self.zhop()
    }

    /// Every sample delivered while descending to `cal_min`.
    fn record_descent(&mut self, cal_min: f64, speed: f64) -> Result<Vec<Sample>> {
        self.sensor.start_streaming()?;
        let recorded = self.record_descent_streaming(cal_min, speed);
        let stopped = self.sensor.stop_streaming();
        let samples = recorded?;
        stopped?;
        Ok(samples)
    }

    fn record_descent_streaming(&mut self, cal_min: f64, speed: f64) -> Result<Vec<Sample>> {
        self.sensor.sample_printtime_sync(SETTLE_SAMPLES, 0)?;
        let sink: Rc<RefCell<Vec<Sample>>> = Rc::default();
        let inner = Rc::clone(&sink);
        let cb: SampleCallback = Box::new(move |s: &Sample| {
            inner.borrow_mut().push(*s);
            Flow::Continue
        });
        let id = self.sensor.acquire(cb, None, None)?;
        let descended = (|| -> Result<()> {
            self.sensor.sample_printtime_sync(SETTLE_SAMPLES, 0)?;
            self.dwell(SETTLE_DWELL)?;
            self.move_to([None, None, Some(cal_min)], speed)?;
            self.dwell(SETTLE_DWELL)?;
            self.sensor.sample_printtime_sync(SETTLE_SAMPLES, 0)?;
            Ok(())
        })();
        let released = self.sensor.release(id);
        descended?;
        released?;
        Ok(std::mem::take(&mut *sink.borrow_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Coil frequency falling off with distance like a real sensor.
    fn curve(z: f64) -> f64 {
        3.2e6 - 1.5e5 / (z + 0.8)
    }

    fn sweep() -> Vec<CalibrationPoint> {
        (0..200)
            .map(|i| {
                let z = 0.1 + 4.9 * f64::from(i) / 199.0;
                CalibrationPoint {
                    freq: curve(z),
                    z,
                    temp: 30.0 + f64::from(i % 3),
                }
            })
            .collect()
    }

    #[test]
    fn fitted_model_reproduces_the_sweep() {
        let model = fit_model("default", &sweep(), ProbeMode::Scan, "CARTOGRAPHER 5.1.0").unwrap();
        assert_eq!(model.mode, "scan");
        assert!((model.min_z - 0.1).abs() < 1e-9);
        assert!((model.max_z - 5.0).abs() < 1e-9);
        assert_eq!(model.temp, 31.0);
        for z in [0.5, 1.0, 2.0, 3.5] {
            let d = model.freq_to_dist_raw(curve(z));
            assert!((d - z).abs() < 5e-3, "z={z} got {d}");
        }
    }

    #[test]
    fn too_few_points_is_a_calibration_error() {
        let pts: Vec<_> = sweep().into_iter().take(POLY_DEGREE).collect();
        let err = fit_model("m", &pts, ProbeMode::Scan, "fw").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScannerError>(),
            Some(ScannerError::Calibration(_))
        ));
    }

    #[test]
    fn dump_has_header_and_fixed_precision() {
        let dir = tempfile::tempdir().unwrap();
        let pts = [CalibrationPoint {
            freq: 3_100_000.123_456,
            z: 1.5,
            temp: 30.25,
        }];
        let path = write_dump(dir.path(), &pts).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "freq,z,temp\n3100000.12346,1.50000,30.250\n");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("scanner-calibrate-") && name.ends_with(".csv"));
    }
}
