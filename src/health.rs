use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};

use crate::config::TuningConfig;

/// Tracks liveness and restart-attempt count for one sensor stream.
/// Unchanged from the teacher's `health_monitor.rs::SensorHealth`.
#[derive(Clone, Debug)]
pub struct SensorHealth {
    pub name: String,
    pub last_update: Arc<Mutex<Instant>>,
    pub silence_threshold: Duration,
    pub max_restart_attempts: u32,
    pub restart_attempts: Arc<Mutex<u32>>,
}

impl SensorHealth {
    pub fn new(name: &str, silence_threshold_secs: u64, max_restarts: u32) -> Self {
        SensorHealth {
            name: name.to_string(),
            last_update: Arc::new(Mutex::new(Instant::now())),
            silence_threshold: Duration::from_secs(silence_threshold_secs),
            max_restart_attempts: max_restarts,
            restart_attempts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn update(&self) {
        if let Ok(mut time) = self.last_update.lock() {
            *time = Instant::now();
        }
    }

    pub fn time_since_last_update(&self) -> Option<Duration> {
        self.last_update.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        self.time_since_last_update()
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }

    pub fn can_restart(&self) -> bool {
        self.restart_attempts
            .lock()
            .ok()
            .map(|r| *r < self.max_restart_attempts)
            .unwrap_or(false)
    }

    pub fn increment_restart_attempts(&self) {
        if let Ok(mut attempts) = self.restart_attempts.lock() {
            *attempts += 1;
        }
    }

    pub fn reset_restart_attempts(&self) {
        if let Ok(mut attempts) = self.restart_attempts.lock() {
            *attempts = 0;
        }
    }

    pub fn get_restart_attempts(&self) -> u32 {
        self.restart_attempts.lock().ok().map(|r| *r).unwrap_or(0)
    }
}

/// Periodic liveness check across all three sensor streams.
pub struct HealthMonitor {
    pub accel: SensorHealth,
    pub gyro: SensorHealth,
    pub gps: SensorHealth,
    check_interval: Duration,
}

impl HealthMonitor {
    pub fn new(tuning: &TuningConfig) -> Self {
        HealthMonitor {
            accel: SensorHealth::new("accel", tuning.accel_silence_secs, 60),
            gyro: SensorHealth::new("gyro", tuning.accel_silence_secs, 60),
            gps: SensorHealth::new("gps", tuning.gps_silence_secs, 60),
            check_interval: Duration::from_secs(2),
        }
    }

    pub fn check_health(&self) -> HealthReport {
        HealthReport {
            accel_healthy: !self.accel.is_silent(),
            accel_silence_duration: self.accel.time_since_last_update(),
            accel_can_restart: self.accel.can_restart(),
            accel_restart_count: self.accel.get_restart_attempts(),

            gyro_healthy: !self.gyro.is_silent(),
            gyro_silence_duration: self.gyro.time_since_last_update(),
            gyro_restart_count: self.gyro.get_restart_attempts(),

            gps_healthy: !self.gps.is_silent(),
            gps_silence_duration: self.gps.time_since_last_update(),
            gps_can_restart: self.gps.can_restart(),
            gps_restart_count: self.gps.get_restart_attempts(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(&TuningConfig::from_defaults())
    }
}

pub struct HealthReport {
    pub accel_healthy: bool,
    pub accel_silence_duration: Option<Duration>,
    pub accel_can_restart: bool,
    pub accel_restart_count: u32,

    pub gyro_healthy: bool,
    pub gyro_silence_duration: Option<Duration>,
    pub gyro_restart_count: u32,

    pub gps_healthy: bool,
    pub gps_silence_duration: Option<Duration>,
    pub gps_can_restart: bool,
    pub gps_restart_count: u32,
}

/// Background task logging silence warnings at `log::warn!`, migrated
/// from the teacher's `eprintln!`-based `health_monitor_task`.
pub async fn health_monitor_task(monitor: Arc<HealthMonitor>) {
    loop {
        sleep(monitor.check_interval).await;
        let report = monitor.check_health();

        if !report.accel_healthy && report.accel_can_restart {
            if let Some(duration) = report.accel_silence_duration {
                log::warn!(
                    "accel silent for {:.1}s (restart attempt {}/{})",
                    duration.as_secs_f64(),
                    report.accel_restart_count,
                    monitor.accel.max_restart_attempts
                );
                monitor.accel.increment_restart_attempts();
            }
        }

        if !report.gps_healthy && report.gps_can_restart {
            if let Some(duration) = report.gps_silence_duration {
                log::warn!(
                    "gps silent for {:.1}s (restart attempt {}/{})",
                    duration.as_secs_f64(),
                    report.gps_restart_count,
                    monitor.gps.max_restart_attempts
                );
                monitor.gps.increment_restart_attempts();
            }
        }

        if !report.accel_healthy && !report.accel_can_restart {
            log::error!("accel dead: max restart attempts exceeded, continuing without accel");
        }

        if !report.gps_healthy && !report.gps_can_restart {
            log::error!("gps dead: max restart attempts exceeded, continuing without gps");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sensor_health_detects_silence_and_resets_on_update() {
        let health = SensorHealth::new("test", 1, 3);
        assert!(!health.is_silent());
        thread::sleep(Duration::from_millis(1100));
        assert!(health.is_silent());
        health.update();
        assert!(!health.is_silent());
    }

    #[test]
    fn restart_attempts_are_counted_and_capped() {
        let health = SensorHealth::new("test", 10, 3);
        assert_eq!(health.get_restart_attempts(), 0);
        assert!(health.can_restart());

        health.increment_restart_attempts();
        health.increment_restart_attempts();
        health.increment_restart_attempts();
        assert_eq!(health.get_restart_attempts(), 3);
        assert!(!health.can_restart());
    }

    #[test]
    fn health_monitor_reports_healthy_on_construction() {
        let monitor = HealthMonitor::default();
        let report = monitor.check_health();
        assert!(report.accel_healthy);
        assert!(report.gps_healthy);
    }
}
