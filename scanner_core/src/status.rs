//! Status objects for dashboards and the periodic stats line.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Result;
use crate::sample::Sample;
use crate::scanner::Scanner;
use crate::session::{Flow, SampleCallback, SessionId};
use crate::util::round_to;

/// Rows buffered by a dump session before they are flushed.
pub const DUMP_BATCH: usize = 50;

/// Receives `{"params": [[dist, temp, pos, freq, vel, time], ...]}` batches.
pub type DumpSink = Box<dyn FnMut(Value)>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastReading {
    pub time: f64,
    pub freq: f64,
    pub temp: f64,
    pub dist: Option<f64>,
}

impl From<&Sample> for LastReading {
    fn from(s: &Sample) -> Self {
        Self {
            time: s.time,
            freq: s.freq,
            temp: s.temp,
            dist: s.finite_dist(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannerStatus {
    pub last_sample: Option<LastReading>,
    pub last_received_sample: Option<Sample>,
    pub model: Option<String>,
}

/// Coil thermistor as a temperature sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoilTemperature {
    pub temperature: f64,
    pub measured_min_temp: f64,
    pub measured_max_temp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeStatus {
    pub name: String,
    pub last_z_result: f64,
}

fn dump_row(s: &Sample) -> Value {
    json!([s.dist, s.temp, s.pos, s.freq, s.vel, s.time])
}

impl Scanner {
    pub fn status(&self) -> ScannerStatus {
        ScannerStatus {
            last_sample: self.sensor.last_sample().map(LastReading::from),
            last_received_sample: self.sensor.last_received().copied(),
            model: self.sensor.model().map(|m| m.name.clone()),
        }
    }

    pub fn coil_temperature(&self) -> CoilTemperature {
        let (min, max) = self.sensor.enricher.measured_range();
        CoilTemperature {
            temperature: round_to(self.sensor.enricher.last_temp(), 2),
            measured_min_temp: round_to(min, 2),
            measured_max_temp: round_to(max, 2),
        }
    }

    pub fn probe_status(&self) -> ProbeStatus {
        ProbeStatus {
            name: self.sensor.name().to_string(),
            last_z_result: self.last_z_result,
        }
    }

    /// Periodic stats line.
    pub fn stats(&self) -> String {
        format!(
            "{}: coil_temp={:.1} refs={}",
            self.sensor.name(),
            self.sensor.enricher.last_temp(),
            self.sensor.engaged()
        )
    }

    /// One fresh reading as `{freq, dist, temp}`.
    pub fn query_status(&mut self) -> Result<Value> {
        let s = self.sensor.sample_async()?;
        Ok(json!({ "freq": s.freq, "dist": s.dist, "temp": s.temp }))
    }

    /// Feed every sample to `sink` in batches until [`Scanner::stop_dump`].
    pub fn start_dump(&mut self, sink: DumpSink) -> Result<SessionId> {
        let buffer: Rc<RefCell<Vec<Value>>> = Rc::default();
        let sink = Rc::new(RefCell::new(sink));

        let (rows, out) = (Rc::clone(&buffer), Rc::clone(&sink));
        let cb: SampleCallback = Box::new(move |s: &Sample| {
            let mut rows = rows.borrow_mut();
            rows.push(dump_row(s));
            if rows.len() > DUMP_BATCH {
                let batch = std::mem::take(&mut *rows);
                (out.borrow_mut())(json!({ "params": batch }));
            }
            Flow::Continue
        });
        let flush = Box::new(move || {
            let batch = std::mem::take(&mut *buffer.borrow_mut());
            if !batch.is_empty() {
                (sink.borrow_mut())(json!({ "params": batch }));
            }
        });
        self.sensor.acquire(cb, None, Some(flush))
    }

    /// End a dump session, flushing what is still buffered.
    pub fn stop_dump(&mut self, id: SessionId) -> Result<()> {
        self.sensor.release(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_rows_keep_field_order() {
        let s = Sample {
            clock: 0,
            time: 1.5,
            data: 7,
            data_smooth: 7.0,
            temp: 30.0,
            freq: 3.0e6,
            dist: Some(2.0),
            pos: None,
            vel: Some(10.0),
        };
        assert_eq!(
            dump_row(&s),
            json!([2.0, 30.0, null, 3.0e6, 10.0, 1.5])
        );
    }

    #[test]
    fn last_reading_drops_infinite_distance() {
        let s = Sample {
            clock: 0,
            time: 0.0,
            data: 0,
            data_smooth: 0.0,
            temp: 25.0,
            freq: 1.0,
            dist: Some(f64::INFINITY),
            pos: None,
            vel: None,
        };
        assert_eq!(LastReading::from(&s).dist, None);
    }
}
