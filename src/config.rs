use clap::Parser;
use serde::{Deserialize, Serialize};

/// Every tunable named across the component design, with the documented
/// defaults. `clap` fills this in from the CLI; a `Config` can also be
/// loaded wholesale from a JSON file via `--config`.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(name = "drivetrace")]
#[command(about = "Real-time sensor-fusion motion tracker", long_about = None)]
pub struct Config {
    /// Directory where session logs, incidents, and crash logs are written.
    #[arg(long, default_value = "drivetrace_sessions")]
    pub session_dir: String,

    /// Seconds of initial stationary window used for calibration.
    #[arg(long, default_value = "3.0")]
    pub calibration_duration_secs: f64,

    /// Accelerometer sample period, milliseconds.
    #[arg(long, default_value = "20")]
    pub accel_period_ms: u64,

    /// GPS poll period, seconds.
    #[arg(long, default_value = "1.0")]
    pub gps_poll_period_secs: f64,

    /// Include gyroscope integration in the ES-EKF.
    #[arg(long, default_value = "true")]
    pub enable_gyro: bool,

    /// Run the incident detector.
    #[arg(long, default_value = "true")]
    pub enable_incident_detector: bool,

    /// Switch to replay mode: path to a recorded session log.
    #[arg(long)]
    pub replay_log_path: Option<String>,

    /// In replay mode, keep every Nth GPS fix and drop the rest.
    #[arg(long)]
    pub gps_decimation: Option<u32>,

    /// Total run duration in seconds; 0 means run until stopped.
    #[arg(value_name = "SECONDS", default_value = "0")]
    pub duration_secs: u64,

    #[command(flatten)]
    pub tuning: TuningConfig,
}

/// Numerical tuning knobs that are not expected to be changed from the
/// command line in normal operation, but are still plain fields so tests
/// can override them directly.
#[derive(clap::Args, Clone, Debug, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Minimum accel+gyro samples required for calibration to succeed.
    #[arg(long, default_value = "50")]
    pub calibration_min_samples: usize,

    /// Maximum accel-magnitude variance tolerated during calibration.
    #[arg(long, default_value = "0.05")]
    pub calibration_max_variance: f64,

    /// Sliding-window length (seconds) for the stationary detector.
    #[arg(long, default_value = "1.0")]
    pub stationary_window_secs: f64,

    /// Variance threshold below which the window is "still".
    #[arg(long, default_value = "0.02")]
    pub stationary_variance_threshold: f64,

    /// GPS speed (m/s) below which the stationary gate is satisfied.
    #[arg(long, default_value = "0.5")]
    pub stationary_gps_speed_threshold: f64,

    /// Gyro magnitude (rad/s) below which the stationary gate is satisfied.
    #[arg(long, default_value = "0.1")]
    pub stationary_gyro_threshold: f64,

    /// Debounce window (seconds) before exiting "stationary".
    #[arg(long, default_value = "0.5")]
    pub stationary_exit_debounce_secs: f64,

    /// NHC lateral-clamp threshold: forward speed above which the
    /// non-holonomic constraint is applied (OQ3, fixed at 0.5 m/s).
    #[arg(long, default_value = "0.5")]
    pub nhc_min_speed: f64,

    /// Minimum GPS speed for trusting GPS-derived course over heading.
    #[arg(long, default_value = "1.0")]
    pub course_min_speed: f64,

    /// Mahalanobis-distance innovation gate, in sigmas.
    #[arg(long, default_value = "5.0")]
    pub mahalanobis_gate: f64,

    /// Maximum plausible speed, m/s; updates that would exceed it are
    /// rejected.
    #[arg(long, default_value = "60.0")]
    pub max_speed: f64,

    /// Maximum covariance trace before rescaling.
    #[arg(long, default_value = "1e4")]
    pub max_covariance_trace: f64,

    /// Minimum/maximum GPS position sigma, meters.
    #[arg(long, default_value = "1.0")]
    pub gps_sigma_min: f64,
    #[arg(long, default_value = "50.0")]
    pub gps_sigma_max: f64,

    /// Accel process-noise std, m/s^2.
    #[arg(long, default_value = "0.5")]
    pub q_accel: f64,

    /// Heading / heading-rate process noise.
    #[arg(long, default_value = "0.01")]
    pub q_heading: f64,
    #[arg(long, default_value = "0.005")]
    pub q_heading_rate: f64,

    /// Accel-bias / gyro-bias random-walk process noise.
    #[arg(long, default_value = "0.001")]
    pub q_accel_bias: f64,
    #[arg(long, default_value = "0.0005")]
    pub q_gyro_bias: f64,

    /// Gravity-well vertical damping factor, per second (OQ2).
    #[arg(long, default_value = "0.80")]
    pub gravity_well_decay_per_sec: f64,

    /// Minimum seconds between opportunistic recalibrations while
    /// stationary (spec.md 4.G).
    #[arg(long, default_value = "120.0")]
    pub recalibration_cooldown_secs: f64,

    /// Seconds of context kept on either side of an incident trigger.
    #[arg(long, default_value = "30.0")]
    pub incident_context_secs: f64,

    /// Seconds of cooldown after an incident before another may fire.
    #[arg(long, default_value = "5.0")]
    pub incident_cooldown_secs: f64,

    /// Assumed sensor sample rate (Hz), used to size incident ring
    /// buffers.
    #[arg(long, default_value = "50")]
    pub sensor_sample_rate_hz: u32,

    /// Seconds of silence before a sensor is declared unhealthy.
    #[arg(long, default_value = "5.0")]
    pub accel_silence_secs: u64,
    #[arg(long, default_value = "30.0")]
    pub gps_silence_secs: u64,

    /// Bounded-queue capacities.
    #[arg(long, default_value = "500")]
    pub accel_queue_capacity: usize,
    #[arg(long, default_value = "50")]
    pub gps_queue_capacity: usize,

    /// Seconds between recorder flushes.
    #[arg(long, default_value = "30.0")]
    pub flush_period_secs: f64,

    /// Grace period before a worker must observe the stop signal.
    #[arg(long, default_value = "2.0")]
    pub shutdown_grace_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        // clap's derive defaults double as the programmatic defaults;
        // parsing an empty argv exercises the same `default_value`s used
        // on the command line.
        Config::parse_from(["drivetrace"])
    }
}

impl TuningConfig {
    /// The documented defaults, for callers (tests, replay) that only need
    /// the tuning knobs and not the full CLI-parsed `Config`.
    pub fn from_defaults() -> Self {
        Config::default().tuning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.calibration_duration_secs, 3.0);
        assert_eq!(cfg.tuning.nhc_min_speed, 0.5);
        assert_eq!(cfg.tuning.max_speed, 60.0);
        assert_eq!(cfg.tuning.gravity_well_decay_per_sec, 0.80);
        assert_eq!(cfg.tuning.incident_context_secs, 30.0);
    }
}
