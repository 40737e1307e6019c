//! Scan-mode bed meshing.
//!
//! The toolhead flies a serpentine path while a session bins every sample
//! into the grid. Post-processing (dump, fault masking, interpolation,
//! completeness check, zero reference) runs on a worker thread while the
//! caller keeps polling for a printer shutdown.

pub mod grid;
pub mod interpolate;
pub mod path;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use crossbeam_channel as xch;
use scanner_traits::ZMesh;

use crate::commands::{Bounds, CommandParams};
use crate::config::{Interpolation, MeshDirection, MeshSettings, Region, ZeroReference};
use crate::error::{Result, ScannerError, fail};
use crate::hw_error::host;
use crate::sample::Sample;
use crate::scanner::Scanner;
use crate::session::{Flow, SampleCallback};
use crate::util::median;

pub use grid::{Binner, Clusters, MeshBounds, ZeroOffset};

/// Dwell queued after the last path point so its samples get flushed.
const FLY_DWELL: f64 = 0.251;
const SETTLE_SKIP: usize = 5;
const ZERO_REF_SKIP: usize = 50;
const ZERO_REF_COUNT: usize = 10;
const WORKER_POLL: Duration = Duration::from_millis(100);

const NO_INTERPOLATOR: &str = "Faulty regions need an interpolator but mesh_interpolation is none.\n\
Set mesh_interpolation to rbf or linear in the [scanner] section,\n\
or remove the faulty regions from [bed_mesh].";

/// Everything needed to turn binned samples into a height matrix.
#[derive(Debug, Clone)]
pub struct MeshJob {
    pub bounds: MeshBounds,
    pub clusters: Clusters,
    pub faulty_regions: Vec<Region>,
    pub interpolation: Interpolation,
    pub trigger_distance: f64,
    pub zero: ZeroOffset,
    pub dump: Option<PathBuf>,
}

impl MeshJob {
    pub fn process(self) -> Result<Vec<Vec<f64>>> {
        if let Some(path) = &self.dump {
            grid::write_dump(path, &self.bounds, &self.clusters)?;
        }
        let mask = grid::fault_mask(&self.bounds, &self.faulty_regions);
        let (mut matrix, faulty) =
            grid::build_matrix(&self.bounds, &self.clusters, &mask, self.trigger_distance);
        if !faulty.is_empty() {
            let interp = interpolate::for_setting(self.interpolation)
                .ok_or_else(|| fail(ScannerError::mesh(NO_INTERPOLATOR)))?;
            interpolate::fill_faulty(&mut matrix, &faulty, interp.as_ref())?;
        }
        grid::check_matrix(&self.bounds, &matrix)?;
        grid::finalize_matrix(&mut matrix, &self.bounds, self.zero, self.trigger_distance);
        Ok(matrix)
    }

    /// [`MeshJob::process`] on a worker thread; `poll` runs between waits
    /// and aborts the wait when it fails.
    pub fn run_on_worker(self, mut poll: impl FnMut() -> Result<()>) -> Result<Vec<Vec<f64>>> {
        let (tx, rx) = xch::bounded(1);
        let handle = std::thread::Builder::new()
            .name("mesh-interp".into())
            .spawn(move || {
                tracing::debug!("mesh worker started");
                let _ = tx.send(self.process());
            })?;
        loop {
            match rx.recv_timeout(WORKER_POLL) {
                Ok(result) => {
                    let _ = handle.join();
                    tracing::debug!(ok = result.is_ok(), "mesh worker finished");
                    return result;
                }
                Err(xch::RecvTimeoutError::Timeout) => poll()?,
                Err(xch::RecvTimeoutError::Disconnected) => {
                    let _ = handle.join();
                    return Err(fail(ScannerError::mesh(
                        "Error processing mesh: worker exited without a result",
                    )));
                }
            }
        }
    }
}

/// Bounding box of every object polygon, or `None` without any points.
fn objects_extent(objects: &[Vec<[f64; 2]>]) -> Option<([f64; 2], [f64; 2])> {
    let mut points = objects.iter().flatten();
    let first = *points.next()?;
    Some(points.fold((first, first), |(lo, hi), p| {
        ([lo[0].min(p[0]), lo[1].min(p[1])], [hi[0].max(p[0]), hi[1].max(p[1])])
    }))
}

/// Mesh parameters after command overrides.
struct MeshRequest {
    bounds: MeshBounds,
    profile: Option<String>,
    zero: Option<ZeroReference>,
    dir: MeshDirection,
    speed: f64,
    runs: usize,
    cluster_size: f64,
}

impl Scanner {
    /// Whether `(x, y)` lies inside a configured faulty region.
    ///
    /// With `add_offsets` the point is a toolhead position and the sensor
    /// offset is applied first.
    pub fn is_faulty(&self, x: f64, y: f64, add_offsets: bool) -> bool {
        let Some(mesh) = &self.mesh else {
            return false;
        };
        let (x, y) = if add_offsets {
            (x + self.probe.x_offset, y + self.probe.y_offset)
        } else {
            (x, y)
        };
        mesh.faulty_regions.iter().any(|r| r.contains(x, y))
    }

    fn offset_xy(&self) -> [f64; 2] {
        [self.probe.x_offset, self.probe.y_offset]
    }

    fn mesh_request(&mut self, settings: &MeshSettings, p: &CommandParams) -> Result<MeshRequest> {
        let finite = |key: &str, v: Option<[f64; 2]>| -> Result<Option<[f64; 2]>> {
            match v {
                Some(pair) if !pair.iter().all(|c| c.is_finite()) => Err(fail(
                    ScannerError::Host(format!("Unable to parse parameter '{key}'")),
                )),
                other => Ok(other),
            }
        };
        let (def_min, def_max) = (settings.min, settings.max);
        let mut min = finite("MESH_MIN", p.pair::<f64>("MESH_MIN")?)?
            .map_or(def_min, |v| [v[0].max(def_min[0]), v[1].max(def_min[1])]);
        let mut max = finite("MESH_MAX", p.pair::<f64>("MESH_MAX")?)?
            .map_or(def_max, |v| [v[0].min(def_max[0]), v[1].min(def_max[1])]);
        let res = p
            .pair::<usize>("PROBE_COUNT")?
            .map_or(settings.probe_count, |v| [v[0].max(3), v[1].max(3)]);
        for axis in 0..2 {
            if min[axis] > max[axis] {
                (min[axis], max[axis]) = (
                    max[axis].max(def_min[axis]),
                    min[axis].min(def_max[axis]),
                );
            }
        }
        let mut profile = Some(p.get_or("PROFILE", "default").to_string());

        let zero = match p.opt_int("RELATIVE_REFERENCE_INDEX", Bounds::none())? {
            Some(i) => Some(ZeroReference::Index(i)),
            None => settings.zero_reference(),
        };

        let mut bounds = MeshBounds::new(min, max, res)?;
        if p.flag("ADAPTIVE", false)? {
            let margin = p.float("ADAPTIVE_MARGIN", settings.adaptive_margin, Bounds::none())?;
            match self.sensor.printer.excluded_objects() {
                None => self.respond(
                    "Requested adaptive mesh, but [exclude_object] is not enabled. Ignoring.",
                ),
                Some(objects) => match objects_extent(&objects) {
                    None => self.respond("Requested adaptive mesh, but no objects defined. Ignoring."),
                    Some((lo, hi)) => {
                        let lo = [lo[0] - margin, lo[1] - margin];
                        let hi = [hi[0] + margin, hi[1] + margin];
                        let shrunk = bounds.shrink_to(lo, hi);
                        bounds = MeshBounds::new(shrunk.min, shrunk.max, shrunk.res)?;
                        tracing::info!(?bounds, "adaptive mesh bounds");
                        profile = None;
                    }
                },
            }
        }

        let dir = match p.get("DIR").map(str::to_lowercase).as_deref() {
            None => settings.direction,
            Some("x") => MeshDirection::X,
            Some("y") => MeshDirection::Y,
            Some(other) => {
                return Err(fail(ScannerError::Host(format!(
                    "Error on '{}': DIR must be x or y, got {other}",
                    p.command()
                ))));
            }
        };

        Ok(MeshRequest {
            bounds,
            profile,
            zero,
            dir,
            speed: p.float("SPEED", settings.speed, Bounds::none().above(0.0))?,
            runs: p.count("RUNS", settings.runs, 1)?,
            cluster_size: p.float("CLUSTER_SIZE", settings.cluster_size, Bounds::none().min(0.0))?,
        })
    }

    /// `BED_MESH_CALIBRATE`.
    pub fn cmd_bed_mesh_calibrate(&mut self, p: &CommandParams) -> Result<()> {
        let method = p.get_or("METHOD", "scanner").to_lowercase();
        if method != "scanner" && method != "scan" {
            return Err(fail(ScannerError::mesh(format!(
                "BED_MESH_CALIBRATE METHOD={method} is not handled by the scanner"
            ))));
        }
        let Some(settings) = self.mesh.clone() else {
            return Err(fail(ScannerError::mesh(
                "Scan meshing is not available: [bed_mesh] is missing or uses mesh_radius",
            )));
        };
        if self.bed_mesh.is_none() {
            return Err(fail(ScannerError::mesh("No bed mesh module to receive the mesh")));
        }
        self.sensor.validate_model_loaded()?;

        let req = self.mesh_request(&settings, p)?;
        let overscan = settings.overscan.unwrap_or(0.0);
        let fly = path::generate_path(&req.bounds, self.offset_xy(), req.dir, overscan);
        tracing::debug!(points = fly.len(), dir = ?req.dir, overscan, "mesh path generated");

        let probe_speed = p.float("PROBE_SPEED", self.probe.speed, Bounds::none().above(0.0))?;
        self.move_to_probing_height(probe_speed)?;

        self.sensor.start_streaming()?;
        let scanned = self.scan_mesh(&req, &settings, &fly);
        let stopped = self.sensor.stop_streaming();
        let (clusters, zero) = scanned?;
        stopped?;

        let job = MeshJob {
            bounds: req.bounds,
            clusters,
            faulty_regions: settings.faulty_regions.clone(),
            interpolation: settings.interpolation,
            trigger_distance: self.sensor.settings.trigger_distance,
            zero,
            dump: p.get("FILENAME").map(PathBuf::from),
        };
        let sensor = &self.sensor;
        let matrix = job.run_on_worker(|| sensor.check_shutdown())?;

        let b = req.bounds;
        let mesh = ZMesh {
            min_x: b.min[0],
            max_x: b.max[0],
            min_y: b.min[1],
            max_y: b.max[1],
            x_count: b.res[0],
            y_count: b.res[1],
            matrix,
        };
        if let Some(bm) = self.bed_mesh.as_mut() {
            host(bm.set_mesh(mesh))?;
        }
        self.respond("Mesh calibration complete");
        if let (Some(profile), Some(bm)) = (req.profile, self.bed_mesh.as_mut()) {
            host(bm.save_profile(&profile))?;
        }
        Ok(())
    }

    /// Fly the path and bin samples; returns the clusters and the zero
    /// reference to apply.
    fn scan_mesh(
        &mut self,
        req: &MeshRequest,
        settings: &MeshSettings,
        fly: &[[f64; 2]],
    ) -> Result<(Clusters, ZeroOffset)> {
        if let Some(first) = fly.first() {
            self.move_to([Some(first[0]), Some(first[1]), None], req.speed)?;
            self.wait_moves()?;
        }
        self.sensor.sample_printtime_sync(SETTLE_SKIP, 0)?;

        let zero_pos = match req.zero {
            Some(ZeroReference::Position(pos)) => Some(pos),
            _ => None,
        };
        let binner = Rc::new(RefCell::new(Binner::new(
            req.bounds,
            self.offset_xy(),
            req.cluster_size,
            zero_pos.map(|pos| (pos, settings.zero_reference_cluster_size)),
        )));
        let sink = Rc::clone(&binner);
        let cb: SampleCallback = Box::new(move |s: &Sample| {
            sink.borrow_mut().add(s);
            Flow::Continue
        });
        let id = self.sensor.acquire(cb, None, None)?;
        let flown = self.fly_path(fly, req.speed, req.runs);
        let released = self.sensor.release(id);
        flown?;
        released?;

        let (clusters, zero_bin, total, invalid) = {
            let mut b = binner.borrow_mut();
            (
                std::mem::take(&mut b.clusters),
                std::mem::take(&mut b.zero_bin),
                b.total,
                b.invalid,
            )
        };
        self.respond(&format!(
            "Sampled {total} total points over {} runs",
            req.runs
        ));
        if invalid > 0 {
            self.respond(&format!("!! Encountered {invalid} invalid samples!"));
        }
        self.respond(&format!("Samples binned in {} clusters", clusters.len()));

        let zero = match req.zero {
            None => ZeroOffset::None,
            Some(ZeroReference::Index(i)) => ZeroOffset::Index(i),
            Some(ZeroReference::Position(_)) if !zero_bin.is_empty() => {
                ZeroOffset::Reading(Some(median(&zero_bin)))
            }
            Some(ZeroReference::Position(pos)) => {
                let off = self.offset_xy();
                self.move_to([Some(pos[0] - off[0]), Some(pos[1] - off[1]), None], req.speed)?;
                let (dist, _) = self.sensor.sample(ZERO_REF_SKIP, ZERO_REF_COUNT)?;
                ZeroOffset::Reading(dist.is_finite().then_some(dist))
            }
        };
        Ok((clusters, zero))
    }

    fn fly_path(&mut self, fly: &[[f64; 2]], speed: f64, runs: usize) -> Result<()> {
        for run in 0..runs {
            let forward = run % 2 == 0;
            let mut points: Box<dyn Iterator<Item = &[f64; 2]>> = if forward {
                Box::new(fly.iter())
            } else {
                Box::new(fly.iter().rev())
            };
            points.try_for_each(|pt| self.move_to([Some(pt[0]), Some(pt[1]), None], speed))?;
        }
        self.dwell(FLY_DWELL)?;
        self.wait_moves()
    }
}
