//! Raw sample to [`Sample`] conversion.
//!
//! Stage order: clock, temperature, filter, frequency, hardware check,
//! distance, trajectory position, axis twist. The enricher performs no I/O;
//! console and shutdown side effects come back as [`Notice`]s for the
//! caller to act on.

use scanner_traits::{AxisTwist, Mcu, RawSample, TemperatureSource, TrajectoryQueue};

use crate::filter::AlphaBetaFilter;
use crate::model::ScannerModel;
use crate::sample::Sample;
use crate::temp_model::TempModel;
use crate::thermistor::Thermistor;

/// Counts per sensor clock cycle, fixed by the firmware's fixed-point format.
pub const COUNT_SCALE: f64 = (1u64 << 28) as f64;
/// Data word reported with a shorted or missing coil.
pub const SHORTED_COIL: u32 = 0x0FFF_FFFF;
/// Highest plausible frequency relative to `fmin`.
pub const FMAX_RATIO: f64 = 1.35;
/// Coil temperatures outside this open interval mean a broken thermistor.
pub const TEMP_VALID: (f64, f64) = (-40.0, 180.0);

/// Sensor reference clock for a given MCU clock.
pub fn sensor_freq(mcu_freq: f64) -> f64 {
    if mcu_freq < 20_000_000.0 {
        mcu_freq
    } else if mcu_freq < 100_000_000.0 {
        mcu_freq / 2.0
    } else {
        mcu_freq / 6.0
    }
}

/// Side effects requested by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Temperature compensation was switched off for the session.
    TempSensorFaulty { temp: f64, announce: bool },
    /// Coil fault; `first` is set on the sample that raised it.
    HardwareFault { msg: String, first: bool },
}

/// Collaborators and session state consulted per sample.
pub struct EnrichContext<'a> {
    pub mcu: &'a dyn Mcu,
    pub trapq: &'a dyn TrajectoryQueue,
    pub temp_override: Option<&'a dyn TemperatureSource>,
    pub axis_twist: Option<&'a dyn AxisTwist>,
    pub model: Option<&'a ScannerModel>,
    /// At least one stream subscriber is engaged.
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct SampleEnricher {
    filter: AlphaBetaFilter,
    thermistor: Thermistor,
    adc_scale: f64,
    sensor_freq: f64,
    tempco: Option<TempModel>,
    fmin: Option<f64>,
    warning_disable: bool,
    hardware_failure: Option<String>,
    last_temp: f64,
    measured_min: f64,
    measured_max: f64,
}

impl SampleEnricher {
    pub fn new(filter: AlphaBetaFilter, mcu: &dyn Mcu) -> Self {
        Self {
            filter,
            thermistor: Thermistor::coil_board(),
            adc_scale: mcu.adc_smooth_count() * mcu.adc_max(),
            sensor_freq: sensor_freq(mcu.clock_freq()),
            tempco: None,
            fmin: None,
            warning_disable: false,
            hardware_failure: None,
            last_temp: 0.0,
            measured_min: 99_999_999.0,
            measured_max: 0.0,
        }
    }

    pub fn with_tempco(mut self, tempco: Option<TempModel>) -> Self {
        self.fmin = tempco.map(|t| t.fmin);
        self.tempco = tempco;
        self
    }

    pub fn with_warning_disable(mut self, disable: bool) -> Self {
        self.warning_disable = disable;
        self
    }

    pub fn thermistor(&self) -> &Thermistor {
        &self.thermistor
    }

    pub fn adc_scale(&self) -> f64 {
        self.adc_scale
    }

    pub fn tempco(&self) -> Option<&TempModel> {
        self.tempco.as_ref()
    }

    pub fn hardware_failure(&self) -> Option<&str> {
        self.hardware_failure.as_deref()
    }

    pub fn last_temp(&self) -> f64 {
        self.last_temp
    }

    pub fn measured_range(&self) -> (f64, f64) {
        (self.measured_min, self.measured_max)
    }

    pub fn reset_filter(&mut self) {
        self.filter.reset();
    }

    pub fn count_to_freq(&self, count: f64) -> f64 {
        count * self.sensor_freq / COUNT_SCALE
    }

    pub fn freq_to_count(&self, freq: f64) -> f64 {
        freq * COUNT_SCALE / self.sensor_freq
    }

    pub fn enrich(&mut self, raw: RawSample, ctx: &EnrichContext<'_>) -> (Sample, Vec<Notice>) {
        let mut notices = Vec::new();

        let clock = ctx.mcu.clock32_to_clock64(raw.clock);
        let time = ctx.mcu.clock_to_print_time(clock);

        let temp = match ctx.temp_override {
            Some(src) => src.get_temp(time),
            None => self
                .thermistor
                .calc_temp(f64::from(raw.temp) / self.adc_scale),
        };
        self.check_temp(temp, &mut notices);

        let smoothed = self.filter.update(time, f64::from(raw.data));
        let freq = self.count_to_freq(smoothed);
        self.check_hardware(raw.data, freq, ctx.streaming, &mut notices);

        let mut dist = ctx
            .model
            .map(|m| m.freq_to_dist(freq, temp, self.tempco.as_ref()));

        let mut pos = None;
        let mut vel = None;
        if let Some(mv) = ctx.trapq.extract(time) {
            let (p, v) = mv.position_at(time);
            if let (Some(d), Some(twist)) = (dist.as_mut(), ctx.axis_twist) {
                *d -= twist.z_compensation(p);
            }
            pos = Some(p);
            vel = Some(v);
        }

        let sample = Sample {
            clock,
            time,
            data: raw.data,
            data_smooth: smoothed,
            temp,
            freq,
            dist,
            pos,
            vel,
        };
        (sample, notices)
    }

    fn check_temp(&mut self, temp: f64, notices: &mut Vec<Notice>) {
        let (lo, hi) = TEMP_VALID;
        if self.tempco.is_some() && !(temp > lo && temp < hi) {
            tracing::error!(temp, "scanner temperature sensor faulty, disabling compensation");
            notices.push(Notice::TempSensorFaulty {
                temp,
                announce: !self.warning_disable,
            });
            self.tempco = None;
        }
        self.last_temp = temp;
        if temp != 0.0 {
            self.measured_min = self.measured_min.min(temp);
            self.measured_max = self.measured_max.max(temp);
        }
    }

    fn check_hardware(&mut self, data: u32, freq: f64, streaming: bool, notices: &mut Vec<Notice>) {
        if let Some(msg) = &self.hardware_failure {
            if streaming {
                notices.push(Notice::HardwareFault {
                    msg: msg.clone(),
                    first: false,
                });
            }
            return;
        }
        let issue = if data == SHORTED_COIL {
            Some("coil is shorted or not connected")
        } else if self.fmin.is_some_and(|fmin| freq > FMAX_RATIO * fmin) {
            Some("coil expected max frequency exceeded")
        } else {
            None
        };
        if let Some(issue) = issue {
            let msg = format!("Scanner hardware issue: {issue}");
            tracing::error!(%msg, "hardware fault");
            self.hardware_failure = Some(msg.clone());
            notices.push(Notice::HardwareFault { msg, first: true });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ConstantTwist, FixedTrapq, MockMcu, NoMotion};
    use crate::polynomial::Polynomial;
    use rstest::rstest;

    fn model() -> ScannerModel {
        ScannerModel {
            name: "default".into(),
            poly: Polynomial::new(vec![10.0, 10.0], [1.0 / 4.0e6, 1.0 / 2.0e6]),
            temp: 30.0,
            min_z: 0.5,
            max_z: 5.0,
            offset: 0.0,
            mode: "scan".into(),
            fw_version: "test".into(),
        }
    }

    fn ctx<'a>(mcu: &'a MockMcu, trapq: &'a dyn TrajectoryQueue, model: &'a ScannerModel) -> EnrichContext<'a> {
        EnrichContext {
            mcu,
            trapq,
            temp_override: None,
            axis_twist: None,
            model: Some(model),
            streaming: true,
        }
    }

    #[rstest]
    #[case(12_000_000.0, 12_000_000.0)]
    #[case(48_000_000.0, 24_000_000.0)]
    #[case(180_000_000.0, 30_000_000.0)]
    fn sensor_clock_tiers(#[case] mcu: f64, #[case] expected: f64) {
        assert_eq!(sensor_freq(mcu), expected);
    }

    #[test]
    fn distances_follow_the_model() {
        let (mcu, _) = MockMcu::new(48_000_000.0);
        let model = model();
        let mut e = SampleEnricher::new(AlphaBetaFilter::new(1.0, 0.0), &mcu);
        let freqs = [3.9e6, 3.2e6, 2.6e6, 2.05e6];
        for (i, f) in freqs.iter().enumerate() {
            let data = (f * COUNT_SCALE / 24.0e6).round() as u32;
            let raw = RawSample {
                clock: 1000 * (i as u32 + 1),
                data,
                temp: 30_000,
            };
            let (s, notices) = e.enrich(raw, &ctx(&mcu, &NoMotion, &model));
            assert!(notices.is_empty());
            let freq = f64::from(data) * 24.0e6 / COUNT_SCALE;
            let x = -1.0 + 2.0 * (1.0 / freq - 1.0 / 4.0e6) / (1.0 / 2.0e6 - 1.0 / 4.0e6);
            let expected = 10.0 + 10.0 * x;
            assert!((s.dist.unwrap() - expected).abs() < 1e-5, "{i}");
            assert_eq!(s.pos, None);
        }
    }

    #[test]
    fn shorted_coil_flags_once() {
        let (mcu, _) = MockMcu::new(48_000_000.0);
        let model = model();
        let mut e = SampleEnricher::new(AlphaBetaFilter::new(0.5, 1e-6), &mcu);
        let raw = RawSample {
            clock: 10,
            data: SHORTED_COIL,
            temp: 30_000,
        };
        let mut c = ctx(&mcu, &NoMotion, &model);
        c.streaming = false;
        let (_, first) = e.enrich(raw, &c);
        assert_eq!(
            first,
            vec![Notice::HardwareFault {
                msg: "Scanner hardware issue: coil is shorted or not connected".into(),
                first: true
            }]
        );
        // Idle repeats stay silent; streaming repeats re-raise without re-flagging.
        let (_, idle) = e.enrich(RawSample { clock: 20, ..raw }, &c);
        assert!(idle.is_empty());
        c.streaming = true;
        let (_, again) = e.enrich(RawSample { clock: 30, ..raw }, &c);
        assert!(matches!(again.as_slice(), [Notice::HardwareFault { first: false, .. }]));
        assert!(e.hardware_failure().is_some());
    }

    #[test]
    fn excessive_frequency_is_a_fault() {
        let (mcu, _) = MockMcu::new(48_000_000.0);
        let model = model();
        let tc = TempModel {
            a_a: None,
            a_b: None,
            b_a: None,
            b_b: None,
            fmin: 2.0e6,
            fmin_temp: 25.0,
        };
        let mut e = SampleEnricher::new(AlphaBetaFilter::new(1.0, 0.0), &mcu).with_tempco(Some(tc));
        let data = (2.9e6 * COUNT_SCALE / 24.0e6) as u32;
        let (_, n) = e.enrich(RawSample { clock: 1, data, temp: 30_000 }, &ctx(&mcu, &NoMotion, &model));
        assert!(matches!(&n[..], [Notice::HardwareFault { msg, .. }] if msg.ends_with("max frequency exceeded")));
    }

    #[test]
    fn broken_thermistor_disables_tempco_for_good() {
        let (mcu, _) = MockMcu::new(48_000_000.0);
        let model = model();
        let tc = TempModel {
            a_a: Some(0.0),
            a_b: Some(0.0),
            b_a: Some(0.0),
            b_b: Some(0.0),
            fmin: 3.0e6,
            fmin_temp: 25.0,
        };
        let mut e = SampleEnricher::new(AlphaBetaFilter::new(1.0, 0.0), &mcu).with_tempco(Some(tc));
        // ADC pinned high reads far below -40C; the frequency itself is plausible.
        let data = (3.2e6 * COUNT_SCALE / 24.0e6).round() as u32;
        let raw = RawSample { clock: 1, data, temp: u32::MAX / 2 };
        let (_, n) = e.enrich(raw, &ctx(&mcu, &NoMotion, &model));
        assert!(matches!(&n[..], [Notice::TempSensorFaulty { announce: true, .. }]));
        assert!(e.tempco().is_none());
        let (_, n) = e.enrich(RawSample { clock: 2, ..raw }, &ctx(&mcu, &NoMotion, &model));
        assert!(n.is_empty());
    }

    #[rstest]
    #[case(f64::NAN, true)]
    #[case(-40.0, true)]
    #[case(-101.3, true)]
    #[case(180.0, true)]
    #[case(-39.9, false)]
    #[case(25.0, false)]
    #[case(179.9, false)]
    fn coil_temperature_validity(#[case] temp: f64, #[case] faulty: bool) {
        let (mcu, _) = MockMcu::new(48_000_000.0);
        let tc = TempModel {
            a_a: Some(0.0),
            a_b: Some(0.0),
            b_a: Some(0.0),
            b_b: Some(0.0),
            fmin: 3.0e6,
            fmin_temp: 25.0,
        };
        let mut e = SampleEnricher::new(AlphaBetaFilter::new(1.0, 0.0), &mcu).with_tempco(Some(tc));
        let mut notices = Vec::new();
        e.check_temp(temp, &mut notices);
        assert_eq!(notices.len(), usize::from(faulty));
        assert_eq!(e.tempco().is_none(), faulty);
    }

    #[test]
    fn twist_applies_only_with_position() {
        let (mcu, _) = MockMcu::new(48_000_000.0);
        let model = model();
        let data = (3.2e6 * COUNT_SCALE / 24.0e6).round() as u32;
        let raw = RawSample { clock: 48, data, temp: 30_000 };
        let twist = ConstantTwist(0.1);

        let mut e = SampleEnricher::new(AlphaBetaFilter::new(1.0, 0.0), &mcu);
        let mut c = ctx(&mcu, &NoMotion, &model);
        c.axis_twist = Some(&twist);
        let (plain, _) = e.enrich(raw, &c);

        let trapq = FixedTrapq([10.0, 20.0, 2.0]);
        let mut e = SampleEnricher::new(AlphaBetaFilter::new(1.0, 0.0), &mcu);
        let mut c = ctx(&mcu, &trapq, &model);
        c.axis_twist = Some(&twist);
        let (moved, _) = e.enrich(raw, &c);

        assert_eq!(moved.pos, Some([10.0, 20.0, 2.0]));
        assert!((plain.dist.unwrap() - moved.dist.unwrap() - 0.1).abs() < 1e-12);
    }
}
