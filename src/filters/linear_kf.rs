use nalgebra::{DMatrix, DVector};

use crate::filters::kalman;
use crate::types::LinearKfState;

/// State order is fixed as `[px, vx, ax, py, vy, ay]` — grouped by
/// channel, not by axis — so the per-axis `F`/`Q` blocks below line up
/// with it directly.
const N: usize = 6;

/// Constant-acceleration 2D Kalman filter: two decoupled, identically
/// shaped `[p, v, a]` channels, one per horizontal axis. No direct
/// teacher equivalent exists (the teacher's filters are all 8/13/15-state
/// EKFs) — built in the house style of `filters/es_ekf.rs`'s struct/impl
/// split between the working filter and its public snapshot type, reusing
/// `filters/kalman.rs` for predict/update instead of hand-rolling its own.
pub struct LinearKf {
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    q_accel: f64,
    gps_sigma_min: f64,
    gps_sigma_max: f64,
    last_update_timestamp: f64,
}

fn channel_block(dt: f64) -> DMatrix<f64> {
    DMatrix::from_row_slice(
        3,
        3,
        &[1.0, dt, 0.5 * dt * dt, 0.0, 1.0, dt, 0.0, 0.0, 1.0],
    )
}

fn channel_process_noise(dt: f64, q_accel: f64) -> DMatrix<f64> {
    // Continuous white-noise-acceleration model discretized over `dt`,
    // driven purely by `q_accel` (m/s^2 std of the unmodeled jerk).
    let var = q_accel * q_accel;
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let dt4 = dt3 * dt;
    DMatrix::from_row_slice(
        3,
        3,
        &[
            0.25 * dt4,
            0.5 * dt3,
            0.5 * dt2,
            0.5 * dt3,
            dt2,
            dt,
            0.5 * dt2,
            dt,
            1.0,
        ],
    ) * var
}

/// Assemble the full 6x6 transition or process-noise matrix from two
/// identical 3x3 per-axis blocks, placed at indices (0,1,2) and (3,4,5)
/// to match the `[px,vx,ax,py,vy,ay]` ordering.
fn block_diagonal(block: &DMatrix<f64>) -> DMatrix<f64> {
    let mut full = DMatrix::<f64>::zeros(N, N);
    for r in 0..3 {
        for c in 0..3 {
            full[(r, c)] = block[(r, c)];
            full[(r + 3, c + 3)] = block[(r, c)];
        }
    }
    full
}

impl LinearKf {
    pub fn new(gps_sigma_min: f64, gps_sigma_max: f64, q_accel: f64) -> Self {
        let mut covariance = DMatrix::<f64>::zeros(N, N);
        for i in 0..N {
            covariance[(i, i)] = match i % 3 {
                0 => 100.0, // position
                1 => 10.0,  // velocity
                _ => 5.0,   // acceleration
            };
        }
        Self {
            state: DVector::zeros(N),
            covariance,
            q_accel,
            gps_sigma_min,
            gps_sigma_max,
            last_update_timestamp: 0.0,
        }
    }

    pub fn predict(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let f = block_diagonal(&channel_block(dt));
        let q = block_diagonal(&channel_process_noise(dt, self.q_accel));
        let (new_state, new_covariance) = kalman::predict(&self.state, &self.covariance, &f, &q);
        self.state = new_state;
        self.covariance = new_covariance;
    }

    /// Direct position update from a GPS fix already projected into the
    /// filter's local ENU frame. `accuracy` (meters) is clamped into
    /// `[gps_sigma_min, gps_sigma_max]` and squared into `R`.
    pub fn update_position(&mut self, timestamp: f64, x: f64, y: f64, accuracy: f64) -> bool {
        let sigma = accuracy.clamp(self.gps_sigma_min, self.gps_sigma_max);
        let r = DMatrix::from_diagonal(&DVector::from_vec(vec![sigma * sigma, sigma * sigma]));
        let mut h = DMatrix::<f64>::zeros(2, N);
        h[(0, 0)] = 1.0; // px
        h[(1, 3)] = 1.0; // py
        let residual = DVector::from_vec(vec![x - self.state[0], y - self.state[3]]);
        self.apply_update(timestamp, &h, &residual, &r)
    }

    /// World-frame accelerometer update (spec.md 4.E): `H` selects `(ax,
    /// ay)` directly, since they are filter states rather than a process
    /// input here (unlike the ES-EKF, which integrates accel in
    /// `predict`). `world_ax`/`world_ay` must already be rotated out of
    /// the device body frame using the latest heading estimate.
    pub fn update_accel(&mut self, timestamp: f64, world_ax: f64, world_ay: f64, r_accel: f64) -> bool {
        let r = DMatrix::from_diagonal(&DVector::from_vec(vec![r_accel, r_accel]));
        let mut h = DMatrix::<f64>::zeros(2, N);
        h[(0, 2)] = 1.0; // ax
        h[(1, 5)] = 1.0; // ay
        let residual = DVector::from_vec(vec![world_ax - self.state[2], world_ay - self.state[5]]);
        self.apply_update(timestamp, &h, &residual, &r)
    }

    fn apply_update(
        &mut self,
        timestamp: f64,
        h: &DMatrix<f64>,
        residual: &DVector<f64>,
        r: &DMatrix<f64>,
    ) -> bool {
        match kalman::update(&self.state, &self.covariance, h, residual, r) {
            kalman::UpdateOutcome::Applied {
                state, covariance, ..
            } => {
                self.state = state;
                self.covariance = covariance;
                self.last_update_timestamp = timestamp;
                true
            }
            kalman::UpdateOutcome::Rejected => false,
        }
    }

    pub fn snapshot(&self) -> LinearKfState {
        LinearKfState {
            px: self.state[0],
            vx: self.state[1],
            ax: self.state[2],
            py: self.state[3],
            vy: self.state[4],
            ay: self.state[5],
            covariance_trace: self.covariance.trace(),
            last_update_timestamp: self.last_update_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn predict_integrates_constant_acceleration() {
        let mut kf = LinearKf::new(1.0, 50.0, 0.5);
        // seed a nonzero acceleration directly for the test
        kf.state[2] = 1.0; // ax
        for _ in 0..10 {
            kf.predict(0.1);
        }
        // after 1s at 1 m/s^2: v ~= 1 m/s, p ~= 0.5 m (ignoring process noise growth)
        assert!(kf.state[1] > 0.9 && kf.state[1] < 1.1);
        assert!(kf.state[0] > 0.4 && kf.state[0] < 0.6);
    }

    #[test]
    fn position_update_pulls_state_toward_measurement() {
        let mut kf = LinearKf::new(1.0, 50.0, 0.5);
        let applied = kf.update_position(1.0, 10.0, -5.0, 2.0);
        assert!(applied);
        assert!(kf.state[0] > 0.0 && kf.state[0] < 10.0);
        assert!(kf.state[3] < 0.0 && kf.state[3] > -5.0);
    }

    #[test]
    fn accel_update_pulls_acceleration_state_toward_measurement() {
        let mut kf = LinearKf::new(1.0, 50.0, 0.5);
        let applied = kf.update_accel(1.0, 2.0, -1.0, 0.25);
        assert!(applied);
        assert!(kf.state[2] > 0.0 && kf.state[2] < 2.0);
        assert!(kf.state[5] < 0.0 && kf.state[5] > -1.0);
    }

    #[test]
    fn gps_sigma_is_clamped_to_bounds() {
        let mut kf = LinearKf::new(2.0, 10.0, 0.5);
        // a wildly overconfident accuracy value should still be clamped,
        // not divide-by-near-zero.
        let applied = kf.update_position(1.0, 1.0, 1.0, 0.001);
        assert!(applied);
        assert_abs_diff_eq!(kf.covariance.trace().is_nan() as i32 as f64, 0.0);
    }
}
