//! Derived, unit-converted treadmill state, built incrementally from
//! `vendor_codec::TelemetrySample`s.
//!
//! Baseline subtraction and distance integration rules come from spec.md
//! §3: `elapsed_time_s`/`calories_kcal` are zeroed at the first sample and
//! reset whenever a later raw counter goes backwards (treadmill reset).
//! When the treadmill reports `dist_raw == 0` the bridge dead-reckons
//! distance from speed instead of trusting the zero.

use std::time::{Duration, Instant};

use crate::vendor_codec::TelemetrySample;

const CAL_DIVISOR: f64 = 97656.0;
const MAX_INTEGRATION_GAP: Duration = Duration::from_secs(2);

/// Unit-converted, baseline-adjusted treadmill state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DerivedState {
    pub speed_kph: f64,
    pub incline_pct: f64,
    pub distance_m: f64,
    pub elapsed_time_s: u32,
    pub calories_kcal: f64,
}

/// Tracks the running baselines and last-sample bookkeeping needed to turn
/// a stream of raw telemetry samples into monotone `DerivedState`.
#[derive(Debug)]
pub struct DerivedStateTracker {
    state: DerivedState,
    time_baseline: Option<u32>,
    cal_baseline: Option<u32>,
    last_time_raw: Option<u32>,
    last_cal_raw: Option<u32>,
    last_sample_at: Option<Instant>,
}

impl Default for DerivedStateTracker {
    fn default() -> Self {
        Self {
            state: DerivedState::default(),
            time_baseline: None,
            cal_baseline: None,
            last_time_raw: None,
            last_cal_raw: None,
            last_sample_at: None,
        }
    }
}

impl DerivedStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> DerivedState {
        self.state
    }

    /// Fold one telemetry sample into the tracked state, returning the
    /// updated `DerivedState`.
    pub fn update(&mut self, sample: TelemetrySample, now: Instant) -> DerivedState {
        self.state.speed_kph = sample.speed_raw as f64 / 100.0;
        self.state.incline_pct = sample.incline_raw as f64 / 100.0;

        // Time baseline: captured at first telemetry, reset on underflow.
        if self.time_baseline.is_none()
            || self
                .last_time_raw
                .is_some_and(|last| sample.time_raw < last)
        {
            self.time_baseline = Some(sample.time_raw);
        }
        self.last_time_raw = Some(sample.time_raw);
        self.state.elapsed_time_s = sample
            .time_raw
            .saturating_sub(self.time_baseline.unwrap_or(sample.time_raw));

        // Calorie baseline follows the same underflow-reset rule.
        if self.cal_baseline.is_none()
            || self.last_cal_raw.is_some_and(|last| sample.cal_raw < last)
        {
            self.cal_baseline = Some(sample.cal_raw);
        }
        self.last_cal_raw = Some(sample.cal_raw);
        let cal_delta = sample
            .cal_raw
            .saturating_sub(self.cal_baseline.unwrap_or(sample.cal_raw));
        self.state.calories_kcal = cal_delta as f64 / CAL_DIVISOR;

        // Distance: trust the device's cumulative counter unless it reads
        // zero, in which case dead-reckon from speed over a bounded gap.
        if sample.dist_raw != 0 {
            let reported_m = sample.dist_raw as f64 / 100.0;
            self.state.distance_m = self.state.distance_m.max(reported_m);
        } else if let Some(last_at) = self.last_sample_at {
            let dt = now.saturating_duration_since(last_at);
            if dt > Duration::ZERO && dt <= MAX_INTEGRATION_GAP {
                let dt_s = dt.as_secs_f64();
                self.state.distance_m += self.state.speed_kph * 1000.0 / 3600.0 * dt_s;
            }
        }

        self.last_sample_at = Some(now);
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(speed: u16, incline: u16, time: u32, cal: u32, dist: u32) -> TelemetrySample {
        TelemetrySample {
            speed_raw: speed,
            incline_raw: incline,
            time_raw: time,
            cal_raw: cal,
            dist_raw: dist,
        }
    }

    #[test]
    fn first_sample_has_zero_elapsed_time() {
        let mut tracker = DerivedStateTracker::new();
        let t0 = Instant::now();
        let s = tracker.update(sample(500, 50, 1000, 0, 0), t0);
        assert_eq!(s.elapsed_time_s, 0);
    }

    #[test]
    fn elapsed_time_is_nondecreasing_while_raw_time_increases() {
        let mut tracker = DerivedStateTracker::new();
        let t0 = Instant::now();
        let mut last = 0;
        for (i, raw_time) in [1000u32, 1001, 1002, 1005, 1010].into_iter().enumerate() {
            let s = tracker.update(sample(0, 0, raw_time, 0, 0), t0 + Duration::from_secs(i as u64));
            assert!(s.elapsed_time_s >= last);
            last = s.elapsed_time_s;
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn elapsed_time_resets_on_underflow() {
        let mut tracker = DerivedStateTracker::new();
        let t0 = Instant::now();
        tracker.update(sample(0, 0, 5000, 0, 0), t0);
        let s = tracker.update(sample(0, 0, 10, 0, 0), t0 + Duration::from_secs(1));
        assert_eq!(s.elapsed_time_s, 0, "a lower raw time re-baselines to 0");
    }

    #[test]
    fn calories_follow_same_baseline_rule() {
        let mut tracker = DerivedStateTracker::new();
        let t0 = Instant::now();
        tracker.update(sample(0, 0, 0, 97656, 0), t0);
        let s = tracker.update(sample(0, 0, 1, 97656 * 2, 0), t0 + Duration::from_secs(1));
        assert!((s.calories_kcal - 1.0).abs() < 1e-9);
    }

    #[test]
    fn distance_uses_device_counter_when_nonzero_and_is_monotone() {
        let mut tracker = DerivedStateTracker::new();
        let t0 = Instant::now();
        let mut last = 0.0;
        for (i, dist_raw) in [100u32, 200, 200, 300].into_iter().enumerate() {
            let s = tracker.update(sample(500, 0, 0, 0, dist_raw), t0 + Duration::from_secs(i as u64));
            assert!(s.distance_m >= last);
            last = s.distance_m;
        }
        assert!((last - 3.0).abs() < 1e-9);
    }

    #[test]
    fn distance_integrates_from_speed_when_device_reports_zero() {
        let mut tracker = DerivedStateTracker::new();
        let t0 = Instant::now();
        // 500 raw -> 5.00 km/h == 1.3889 m/s
        tracker.update(sample(500, 0, 0, 0, 0), t0);
        let s = tracker.update(sample(500, 0, 1, 0, 0), t0 + Duration::from_millis(1000));
        let expected = 5.0 * 1000.0 / 3600.0; // one second at 5 km/h
        assert!((s.distance_m - expected).abs() < 1e-6);
    }

    #[test]
    fn distance_does_not_integrate_across_large_gaps() {
        let mut tracker = DerivedStateTracker::new();
        let t0 = Instant::now();
        tracker.update(sample(500, 0, 0, 0, 0), t0);
        let s = tracker.update(sample(500, 0, 5, 0, 0), t0 + Duration::from_secs(3));
        assert_eq!(s.distance_m, 0.0, "gap > 2s must not be integrated");
    }

    #[test]
    fn decode_then_update_pipeline() {
        let mut payload = vec![0u8; 46];
        payload[3] = 0x2F;
        payload[8..10].copy_from_slice(&1200u16.to_le_bytes());
        payload[27..31].copy_from_slice(&60u32.to_le_bytes());
        let sample = crate::vendor_codec::decode_telemetry(&payload).expect("decodes");
        let mut tracker = DerivedStateTracker::new();
        let s = tracker.update(sample, Instant::now());
        assert!((s.speed_kph - 12.0).abs() < 1e-9);
        assert_eq!(s.elapsed_time_s, 0);
    }
}
