use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector};

use crate::config::TuningConfig;
use crate::filters::es_ekf::EsEkf;

/// Windowed stationary/moving classifier plus the ZUPT/NHC
/// pseudo-measurements it gates. Grounded in the teacher's
/// `sensor_fusion.rs` (`zupt_accel_low`/`zupt_accel_high`/
/// `zupt_gyro_threshold` magnitude-band gate, `nhc_interval_secs`/
/// `nhc_max_gap_secs`/`nhc_r` formula), generalized with a windowed
/// variance gate and an exit debounce the teacher's flat boolean check
/// did not have (spec.md 4.G's explicit requirement).
pub struct StationaryDetector {
    accel_window: VecDeque<(f64, f64)>, // (timestamp, magnitude)
    window_secs: f64,
    variance_threshold: f64,
    gps_speed_threshold: f64,
    gyro_threshold: f64,
    exit_debounce_secs: f64,
    currently_stationary: bool,
    candidate_exit_since: Option<f64>,
    last_gps_speed: Option<f64>,
    last_gyro_magnitude: f64,
    nhc_min_speed: f64,
    last_nhc_timestamp: Option<f64>,
    last_gps_timestamp: Option<f64>,
}

const ZUPT_ACCEL_LOW: f64 = 9.5;
const ZUPT_ACCEL_HIGH: f64 = 10.1;
const NHC_INTERVAL_SECS: f64 = 1.0;
const NHC_MAX_GAP_SECS: f64 = 10.0;

impl StationaryDetector {
    pub fn new(tuning: &TuningConfig) -> Self {
        Self {
            accel_window: VecDeque::new(),
            window_secs: tuning.stationary_window_secs,
            variance_threshold: tuning.stationary_variance_threshold,
            gps_speed_threshold: tuning.stationary_gps_speed_threshold,
            gyro_threshold: tuning.stationary_gyro_threshold,
            exit_debounce_secs: tuning.stationary_exit_debounce_secs,
            currently_stationary: false,
            candidate_exit_since: None,
            last_gps_speed: None,
            last_gyro_magnitude: 0.0,
            nhc_min_speed: tuning.nhc_min_speed,
            last_nhc_timestamp: None,
            last_gps_timestamp: None,
        }
    }

    pub fn push_accel_magnitude(&mut self, timestamp: f64, magnitude: f64) {
        self.accel_window.push_back((timestamp, magnitude));
        while let Some(&(oldest_ts, _)) = self.accel_window.front() {
            if timestamp - oldest_ts > self.window_secs {
                self.accel_window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn observe_gyro_magnitude(&mut self, magnitude: f64) {
        self.last_gyro_magnitude = magnitude;
    }

    pub fn observe_gps_speed(&mut self, timestamp: f64, speed: Option<f64>) {
        if speed.is_some() {
            self.last_gps_speed = speed;
            self.last_gps_timestamp = Some(timestamp);
        }
    }

    fn windowed_variance(&self) -> Option<f64> {
        if self.accel_window.len() < 2 {
            return None;
        }
        let n = self.accel_window.len() as f64;
        let mean = self.accel_window.iter().map(|(_, m)| m).sum::<f64>() / n;
        let var = self
            .accel_window
            .iter()
            .map(|(_, m)| (m - mean).powi(2))
            .sum::<f64>()
            / n;
        Some(var)
    }

    /// AND of the variance-window gate, the GPS-speed gate (if a fix is
    /// available), and the gyro-magnitude gate, debounced on exit: a
    /// single failing sample doesn't immediately flip moving until the
    /// failing condition has persisted for `stationary_exit_debounce_secs`.
    pub fn update(&mut self, timestamp: f64) -> bool {
        let variance_gate = self
            .windowed_variance()
            .map(|v| v < self.variance_threshold)
            .unwrap_or(false);
        let gps_gate = self
            .last_gps_speed
            .map(|s| s < self.gps_speed_threshold)
            .unwrap_or(true);
        let gyro_gate = self.last_gyro_magnitude < self.gyro_threshold;
        let accel_band_gate = self
            .accel_window
            .back()
            .map(|&(_, m)| m > ZUPT_ACCEL_LOW && m < ZUPT_ACCEL_HIGH)
            .unwrap_or(false);

        let all_gates_pass = variance_gate && gps_gate && gyro_gate && accel_band_gate;

        if all_gates_pass {
            self.candidate_exit_since = None;
            self.currently_stationary = true;
        } else if self.currently_stationary {
            let exit_since = *self.candidate_exit_since.get_or_insert(timestamp);
            if timestamp - exit_since >= self.exit_debounce_secs {
                self.currently_stationary = false;
                self.candidate_exit_since = None;
            }
        }

        self.currently_stationary
    }

    pub fn is_stationary(&self) -> bool {
        self.currently_stationary
    }

    fn gps_gap_at(&self, timestamp: f64) -> f64 {
        self.last_gps_timestamp
            .map(|t| (timestamp - t).max(0.0))
            .unwrap_or(f64::MAX)
    }

    /// Apply the zero-velocity pseudo-measurement when stationary, and
    /// (regardless of stationary state) the non-holonomic lateral-clamp
    /// pseudo-measurement once per `nhc_interval_secs` when moving faster
    /// than `nhc_min_speed` and a recent-enough GPS fix anchors the
    /// heading (teacher's `apply_nhc`, `nhc_r = (1 + gap*0.5).min(5.0)`).
    pub fn apply(&mut self, ekf: &mut EsEkf, timestamp: f64) {
        if self.update(timestamp) {
            ekf.hard_zupt_reset();
            let zero = DVector::from_vec(vec![0.0, 0.0]);
            let r = DMatrix::from_diagonal(&DVector::from_vec(vec![1e-3, 1e-3]));
            ekf.update_body_velocity(timestamp, &zero, &r);
            return;
        }

        if ekf.speed() < self.nhc_min_speed {
            return;
        }

        if let Some(last) = self.last_nhc_timestamp {
            if timestamp - last < NHC_INTERVAL_SECS {
                return;
            }
        }

        let gap = self.gps_gap_at(timestamp);
        if gap > NHC_MAX_GAP_SECS {
            self.last_nhc_timestamp = Some(timestamp);
            return;
        }

        let nhc_r = (1.0 + gap * 0.5).min(5.0);
        ekf.update_lateral_velocity(timestamp, nhc_r);
        self.last_nhc_timestamp = Some(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> TuningConfig {
        TuningConfig::from_defaults()
    }

    #[test]
    fn detects_stationary_from_flat_accel_window() {
        let mut det = StationaryDetector::new(&tuning());
        det.observe_gps_speed(0.0, Some(0.0));
        for i in 0..60 {
            let t = i as f64 * 0.02;
            det.push_accel_magnitude(t, 9.81);
            det.observe_gyro_magnitude(0.01);
            det.update(t);
        }
        assert!(det.is_stationary());
    }

    #[test]
    fn moving_gps_speed_prevents_stationary_classification() {
        let mut det = StationaryDetector::new(&tuning());
        det.observe_gps_speed(0.0, Some(10.0));
        for i in 0..60 {
            let t = i as f64 * 0.02;
            det.push_accel_magnitude(t, 9.81);
            det.observe_gyro_magnitude(0.0);
            det.update(t);
        }
        assert!(!det.is_stationary());
    }

    #[test]
    fn exit_is_debounced_against_a_single_noisy_sample() {
        let mut det = StationaryDetector::new(&tuning());
        det.observe_gps_speed(0.0, Some(0.0));
        for i in 0..60 {
            let t = i as f64 * 0.02;
            det.push_accel_magnitude(t, 9.81);
            det.observe_gyro_magnitude(0.0);
            det.update(t);
        }
        assert!(det.is_stationary());

        // one spiky sample shouldn't immediately flip to moving
        let spike_t = 60.0 * 0.02;
        det.push_accel_magnitude(spike_t, 15.0);
        assert!(det.update(spike_t));
    }

    #[test]
    fn zupt_reset_zeroes_ekf_velocity_when_stationary() {
        let mut det = StationaryDetector::new(&tuning());
        let mut ekf = EsEkf::new(0.80, 0.01, 0.005, 0.001, 0.0005);
        det.observe_gps_speed(0.0, Some(0.0));
        for i in 0..60 {
            let t = i as f64 * 0.02;
            det.push_accel_magnitude(t, 9.81);
            det.observe_gyro_magnitude(0.0);
        }
        let t = 60.0 * 0.02;
        det.apply(&mut ekf, t);
        assert!(ekf.speed() < 1e-6);
    }
}
