use std::sync::Arc;

use anyhow::{bail, Result};
use arc_swap::ArcSwap;

use crate::config::TuningConfig;
use crate::types::{AccelSample, CalibrationProfile, GyroSample};

/// Computes a `CalibrationProfile` from a stationary-window buffer of
/// accel/gyro samples. Fails (never panics) when the buffer is too short
/// or too noisy to trust, per spec.md 4.C.
pub fn calibrate(
    accel_samples: &[AccelSample],
    gyro_samples: &[GyroSample],
    now: f64,
    tuning: &TuningConfig,
) -> Result<CalibrationProfile> {
    if accel_samples.len() < tuning.calibration_min_samples {
        bail!(
            "calibration failed: only {} accel samples, need at least {}",
            accel_samples.len(),
            tuning.calibration_min_samples
        );
    }

    let n = accel_samples.len() as f64;
    let mut sum = [0.0; 3];
    for s in accel_samples {
        sum[0] += s.x;
        sum[1] += s.y;
        sum[2] += s.z;
    }
    let mean = [sum[0] / n, sum[1] / n, sum[2] / n];
    let gravity_magnitude = (mean[0] * mean[0] + mean[1] * mean[1] + mean[2] * mean[2]).sqrt();

    let variance = accel_samples
        .iter()
        .map(|s| {
            let mag = s.magnitude();
            (mag - gravity_magnitude).powi(2)
        })
        .sum::<f64>()
        / n;

    if variance > tuning.calibration_max_variance {
        bail!(
            "calibration failed: accel variance {:.4} exceeds max {:.4} — device was not held still",
            variance,
            tuning.calibration_max_variance
        );
    }

    let gyro_bias = if gyro_samples.is_empty() {
        [0.0, 0.0, 0.0]
    } else {
        let gn = gyro_samples.len() as f64;
        let mut gsum = [0.0; 3];
        for g in gyro_samples {
            gsum[0] += g.wx;
            gsum[1] += g.wy;
            gsum[2] += g.wz;
        }
        [gsum[0] / gn, gsum[1] / gn, gsum[2] / gn]
    };

    Ok(CalibrationProfile {
        accel_bias: mean,
        gravity_magnitude,
        gyro_bias,
        created_at: now,
        sample_count: accel_samples.len(),
        variance,
    })
}

/// Read-mostly holder for the active `CalibrationProfile`. Re-calibration
/// publishes a fresh profile via an atomic pointer swap; readers never
/// observe a torn or locked value.
#[derive(Clone)]
pub struct CalibrationHandle {
    inner: Arc<ArcSwap<CalibrationProfile>>,
}

impl CalibrationHandle {
    pub fn new(profile: CalibrationProfile) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(profile)),
        }
    }

    pub fn load(&self) -> Arc<CalibrationProfile> {
        self.inner.load_full()
    }

    /// Install a freshly computed profile, replacing the old one
    /// atomically. The old profile is never mutated.
    pub fn republish(&self, profile: CalibrationProfile) {
        self.inner.store(Arc::new(profile));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still_accel(n: usize, gravity: f64) -> Vec<AccelSample> {
        (0..n)
            .map(|i| AccelSample {
                timestamp: i as f64 * 0.02,
                x: 0.0,
                y: 0.0,
                z: gravity,
            })
            .collect()
    }

    #[test]
    fn calibrate_recovers_gravity_and_bias() {
        let tuning = TuningConfig::from_defaults();
        let accel = still_accel(200, 9.81);
        let gyro: Vec<GyroSample> = (0..200)
            .map(|i| GyroSample {
                timestamp: i as f64 * 0.02,
                wx: 0.01,
                wy: -0.02,
                wz: 0.0,
            })
            .collect();

        let profile = calibrate(&accel, &gyro, 0.0, &tuning).unwrap();
        assert!((profile.gravity_magnitude - 9.81).abs() < 1e-9);
        assert!((profile.gyro_bias[0] - 0.01).abs() < 1e-9);
        assert!((profile.gyro_bias[1] + 0.02).abs() < 1e-9);
    }

    #[test]
    fn calibrate_idempotent_within_1e12() {
        let tuning = TuningConfig::from_defaults();
        let accel = still_accel(300, 9.81);
        let gyro = vec![];

        let p1 = calibrate(&accel, &gyro, 0.0, &tuning).unwrap();
        let p2 = calibrate(&accel, &gyro, 0.0, &tuning).unwrap();
        assert!((p1.accel_bias[2] - p2.accel_bias[2]).abs() < 1e-12);
        assert!((p1.gravity_magnitude - p2.gravity_magnitude).abs() < 1e-12);
    }

    #[test]
    fn calibrate_fails_on_too_few_samples() {
        let tuning = TuningConfig::from_defaults();
        let accel = still_accel(5, 9.81);
        let result = calibrate(&accel, &[], 0.0, &tuning);
        assert!(result.is_err());
    }

    #[test]
    fn calibrate_fails_when_not_still() {
        let tuning = TuningConfig::from_defaults();
        let accel: Vec<AccelSample> = (0..200)
            .map(|i| AccelSample {
                timestamp: i as f64 * 0.02,
                x: (i as f64 * 0.3).sin() * 3.0,
                y: 0.0,
                z: 9.81,
            })
            .collect();
        let result = calibrate(&accel, &[], 0.0, &tuning);
        assert!(result.is_err());
    }

    #[test]
    fn republish_is_visible_to_existing_handles() {
        let initial = CalibrationProfile {
            accel_bias: [0.0, 0.0, 0.0],
            gravity_magnitude: 9.81,
            gyro_bias: [0.0, 0.0, 0.0],
            created_at: 0.0,
            sample_count: 10,
            variance: 0.0,
        };
        let handle = CalibrationHandle::new(initial);
        let reader = handle.clone();

        let fresh = CalibrationProfile {
            gravity_magnitude: 9.83,
            ..*reader.load()
        };
        handle.republish(fresh);

        assert!((reader.load().gravity_magnitude - 9.83).abs() < 1e-12);
    }
}
