use serde::{Deserialize, Serialize};

/// One accelerometer sample in the device frame (m/s^2).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AccelSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// One gyroscope sample in the device frame (rad/s).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GyroSample {
    pub timestamp: f64,
    pub wx: f64,
    pub wy: f64,
    pub wz: f64,
}

impl GyroSample {
    pub fn magnitude(&self) -> f64 {
        (self.wx * self.wx + self.wy * self.wy + self.wz * self.wz).sqrt()
    }
}

/// One absolute-position fix. `latitude`/`longitude` absent means "no fix";
/// everything else is genuinely optional per the oracle contract.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GpsFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub accuracy: f64,
    /// Timestamp as reported by the oracle itself, if it gave one. The
    /// fix is always timestamped at arrival (`timestamp` above); this is
    /// kept only as a secondary diagnostic field.
    pub source_timestamp: Option<f64>,
}

/// Per-axis accelerometer bias, gravity magnitude, and gyro bias estimated
/// during the initial stationary window. Immutable once installed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub accel_bias: [f64; 3],
    pub gravity_magnitude: f64,
    pub gyro_bias: [f64; 3],
    pub created_at: f64,
    pub sample_count: usize,
    pub variance: f64,
}

impl CalibrationProfile {
    /// Subtract per-axis bias and return the orientation-independent
    /// motion magnitude alongside the bias-corrected 3-vector.
    pub fn calibrated_accel(&self, sample: &AccelSample) -> (f64, [f64; 3]) {
        let corrected = [
            sample.x - self.accel_bias[0],
            sample.y - self.accel_bias[1],
            sample.z - self.accel_bias[2],
        ];
        let mag = (corrected[0] * corrected[0]
            + corrected[1] * corrected[1]
            + corrected[2] * corrected[2])
            .sqrt();
        let motion_magnitude = (mag - self.gravity_magnitude).max(0.0);
        (motion_magnitude, corrected)
    }

    pub fn calibrated_gyro(&self, sample: &GyroSample) -> [f64; 3] {
        [
            sample.wx - self.gyro_bias[0],
            sample.wy - self.gyro_bias[1],
            sample.wz - self.gyro_bias[2],
        ]
    }
}

/// Snapshot of the 6-state linear Kalman filter, suitable for the
/// `ekf_6d` field of a `FusedReading`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct LinearKfState {
    pub px: f64,
    pub vx: f64,
    pub ax: f64,
    pub py: f64,
    pub vy: f64,
    pub ay: f64,
    pub covariance_trace: f64,
    pub last_update_timestamp: f64,
}

/// Snapshot of the 15-state ES-EKF, suitable for the `experimental_15d`
/// field of a `FusedReading`. `slack` is reserved (see OQ1 in DESIGN.md)
/// and always 0.0.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EsEkfState {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub heading: f64,
    pub heading_rate: f64,
    pub accel_bias: [f64; 3],
    pub gyro_bias: [f64; 3],
    pub slack: f64,
    pub covariance_trace: f64,
    pub last_update_timestamp: f64,
    pub origin_lat: f64,
    pub origin_lon: f64,
}

impl EsEkfState {
    pub fn speed(&self) -> f64 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}

/// Derived scalars computed from sensor + filter outputs for one tick.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DerivedScalars {
    pub specific_power_w_per_kg: f64,
}

/// One output record per fused tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusedReading {
    pub timestamp: f64,
    pub accel: Option<AccelSample>,
    pub gyro: Option<GyroSample>,
    pub gps: Option<GpsFix>,
    pub ekf_6d: Option<LinearKfState>,
    pub experimental_15d: Option<EsEkfState>,
    pub specific_power_w_per_kg: f64,
}

/// One simplified trajectory point, thinned for storage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub timestamp: f64,
    pub ekf_x: f64,
    pub ekf_y: f64,
    pub ekf_velocity: f64,
    pub ekf_heading_deg: f64,
}

/// One detected driving incident, with ±CONTEXT_SECONDS of raw sample
/// context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub event_type: IncidentType,
    pub magnitude: f64,
    pub trigger_timestamp: f64,
    pub threshold: f64,
    pub accel_context: Vec<AccelSample>,
    pub gyro_context: Vec<GyroSample>,
    pub gps_context: Vec<GpsFix>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    HardBraking,
    Impact,
    Swerve,
}

/// Metadata describing one recorded session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub version: u32,
    pub source: String,
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub gps_fixes: u64,
}

/// The full persisted session log: `{ readings, trajectories, metadata }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionLog {
    pub readings: Vec<FusedReading>,
    pub trajectories: Vec<TrajectoryPoint>,
    pub incidents: Vec<IncidentRecord>,
    pub metadata: SessionMetadata,
}

pub const SESSION_LOG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibrated_accel_removes_gravity_and_bias() {
        let profile = CalibrationProfile {
            accel_bias: [0.1, -0.2, 0.3],
            gravity_magnitude: 9.81,
            gyro_bias: [0.0, 0.0, 0.0],
            created_at: 0.0,
            sample_count: 100,
            variance: 0.001,
        };
        let sample = AccelSample {
            timestamp: 1.0,
            x: 0.1,
            y: -0.2,
            z: 9.81 + 0.3,
        };
        let (motion_mag, corrected) = profile.calibrated_accel(&sample);
        assert!(motion_mag < 1e-9);
        assert!((corrected[2] - 9.81).abs() < 1e-9);
    }

    #[test]
    fn accel_magnitude_is_euclidean_norm() {
        let sample = AccelSample {
            timestamp: 0.0,
            x: 3.0,
            y: 4.0,
            z: 0.0,
        };
        assert!((sample.magnitude() - 5.0).abs() < 1e-12);
    }
}
