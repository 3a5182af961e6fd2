use std::collections::VecDeque;

use crate::config::TuningConfig;
use crate::types::{AccelSample, GpsFix, GyroSample, IncidentRecord, IncidentType};

const HARD_BRAKING_G: f64 = 0.8;
const IMPACT_G: f64 = 1.5;
const SWERVE_RAD_PER_SEC: f64 = 1.047; // 60 deg/s
const SWERVE_MIN_GPS_SPEED: f64 = 2.0; // m/s
const GRAVITY: f64 = 9.81;

/// Three ring buffers of raw samples plus threshold/cooldown logic, so every
/// incident is saved with `±incident_context_secs` of surrounding context
/// (spec.md 4.H). Sized `2 * CONTEXT_SECONDS * sample_rate` per-buffer, same
/// as the Python original this was rebuilt from.
pub struct IncidentDetector {
    accel_buffer: VecDeque<AccelSample>,
    gyro_buffer: VecDeque<GyroSample>,
    gps_buffer: VecDeque<GpsFix>,
    buffer_capacity: usize,
    context_secs: f64,
    cooldown_secs: f64,
    last_trigger_timestamp: Option<f64>,
}

impl IncidentDetector {
    pub fn new(tuning: &TuningConfig) -> Self {
        let buffer_capacity =
            (2.0 * tuning.incident_context_secs * tuning.sensor_sample_rate_hz as f64) as usize;
        Self {
            accel_buffer: VecDeque::with_capacity(buffer_capacity),
            gyro_buffer: VecDeque::with_capacity(buffer_capacity),
            gps_buffer: VecDeque::with_capacity(buffer_capacity),
            buffer_capacity: buffer_capacity.max(1),
            context_secs: tuning.incident_context_secs,
            cooldown_secs: tuning.incident_cooldown_secs,
            last_trigger_timestamp: None,
        }
    }

    pub fn push_accel(&mut self, sample: AccelSample) {
        push_bounded(&mut self.accel_buffer, sample, self.buffer_capacity);
    }

    pub fn push_gyro(&mut self, sample: GyroSample) {
        push_bounded(&mut self.gyro_buffer, sample, self.buffer_capacity);
    }

    pub fn push_gps(&mut self, fix: GpsFix) {
        push_bounded(&mut self.gps_buffer, fix, self.buffer_capacity);
    }

    /// Check every buffered stream against the thresholds at the latest
    /// tick, applying the cooldown gate. `longitudinal_accel` is the
    /// world-frame forward acceleration (negative under braking);
    /// `accel_magnitude` is the gravity-removed motion magnitude.
    pub fn check(
        &mut self,
        timestamp: f64,
        longitudinal_accel: f64,
        accel_magnitude: f64,
        gyro_z: f64,
        gps_speed: Option<f64>,
    ) -> Option<IncidentRecord> {
        if let Some(last) = self.last_trigger_timestamp {
            if timestamp - last < self.cooldown_secs {
                return None;
            }
        }

        let decel_g = (-longitudinal_accel) / GRAVITY;
        let impact_g = accel_magnitude / GRAVITY;

        let (event_type, magnitude, threshold) = if impact_g > IMPACT_G {
            (IncidentType::Impact, impact_g, IMPACT_G)
        } else if decel_g > HARD_BRAKING_G {
            (IncidentType::HardBraking, decel_g, HARD_BRAKING_G)
        } else if gyro_z.abs() > SWERVE_RAD_PER_SEC
            && gps_speed.map(|s| s > SWERVE_MIN_GPS_SPEED).unwrap_or(false)
        {
            (IncidentType::Swerve, gyro_z.abs(), SWERVE_RAD_PER_SEC)
        } else {
            return None;
        };

        self.last_trigger_timestamp = Some(timestamp);

        Some(IncidentRecord {
            event_type,
            magnitude,
            trigger_timestamp: timestamp,
            threshold,
            accel_context: extract_context(&self.accel_buffer, timestamp, self.context_secs, |s| {
                s.timestamp
            }),
            gyro_context: extract_context(&self.gyro_buffer, timestamp, self.context_secs, |s| {
                s.timestamp
            }),
            gps_context: extract_context(&self.gps_buffer, timestamp, self.context_secs, |s| {
                s.timestamp
            }),
        })
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    if buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

fn extract_context<T: Clone>(
    buffer: &VecDeque<T>,
    event_time: f64,
    context_secs: f64,
    ts: impl Fn(&T) -> f64,
) -> Vec<T> {
    buffer
        .iter()
        .filter(|item| (ts(item) - event_time).abs() <= context_secs)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> TuningConfig {
        TuningConfig::from_defaults()
    }

    fn accel_at(t: f64, mag: f64) -> AccelSample {
        AccelSample {
            timestamp: t,
            x: 0.0,
            y: 0.0,
            z: mag,
        }
    }

    #[test]
    fn impact_spike_triggers_exactly_once_with_context() {
        let mut det = IncidentDetector::new(&tuning());
        for i in 0..50 {
            let t = i as f64 * 0.02;
            det.push_accel(accel_at(t, GRAVITY));
            assert!(det.check(t, 0.0, 0.0, 0.0, None).is_none());
        }
        let spike_t = 1.0;
        det.push_accel(accel_at(spike_t, 3.0 * GRAVITY));
        let incident = det
            .check(spike_t, 0.0, 3.0 * GRAVITY - GRAVITY, 0.0, None)
            .expect("impact should trigger");
        assert_eq!(incident.event_type, IncidentType::Impact);
        assert!(!incident.accel_context.is_empty());

        // Immediately after, still within cooldown: no duplicate.
        det.push_accel(accel_at(spike_t + 0.02, 3.0 * GRAVITY));
        assert!(det
            .check(spike_t + 0.02, 0.0, 3.0 * GRAVITY - GRAVITY, 0.0, None)
            .is_none());
    }

    #[test]
    fn hard_braking_detected_above_threshold() {
        let mut det = IncidentDetector::new(&tuning());
        let incident = det
            .check(10.0, -0.85 * GRAVITY, 0.85 * GRAVITY, 0.0, Some(20.0))
            .expect("hard braking should trigger");
        assert_eq!(incident.event_type, IncidentType::HardBraking);
        assert!(incident.magnitude >= HARD_BRAKING_G);
    }

    #[test]
    fn swerve_requires_both_gyro_and_gps_speed_gates() {
        let mut det = IncidentDetector::new(&tuning());
        assert!(det.check(1.0, 0.0, 0.0, 1.2, Some(1.0)).is_none());
        assert!(det.check(1.0, 0.0, 0.0, 0.5, Some(20.0)).is_none());
        let incident = det
            .check(1.0, 0.0, 0.0, 1.2, Some(20.0))
            .expect("swerve should trigger");
        assert_eq!(incident.event_type, IncidentType::Swerve);
    }

    #[test]
    fn context_window_excludes_samples_outside_range() {
        let mut det = IncidentDetector::new(&tuning());
        det.push_accel(accel_at(0.0, GRAVITY));
        det.push_accel(accel_at(100.0, GRAVITY));
        let incident = det
            .check(31.0, -1.0 * GRAVITY, 0.0, 0.0, None)
            .expect("hard braking threshold crossed");
        assert!(incident
            .accel_context
            .iter()
            .all(|s| (s.timestamp - 31.0).abs() <= det.context_secs));
    }
}
