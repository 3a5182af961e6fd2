use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const CIRCUIT_BREAKER_WINDOW: Duration = Duration::from_secs(10);
const CIRCUIT_BREAKER_FAILS: usize = 5;

/// Restart/backoff/circuit-breaker state for a single supervised stream.
/// Unchanged from the teacher's `restart_manager.rs::RestartState`,
/// migrated from `eprintln!` to `log::warn!`/`info!`.
#[derive(Clone, Debug)]
pub struct RestartState {
    pub name: String,
    pub restart_needed: bool,
    pub next_retry_time: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
    pub base_cooldown: Duration,
    pub current_cooldown: Duration,
    failure_window: VecDeque<Instant>,
    circuit_tripped: bool,
}

impl RestartState {
    pub fn new(name: &str, max_attempts: u32, base_cooldown_secs: u64) -> Self {
        let base_cooldown = Duration::from_secs(base_cooldown_secs);
        RestartState {
            name: name.to_string(),
            restart_needed: false,
            next_retry_time: Instant::now(),
            attempts: 0,
            max_attempts,
            base_cooldown,
            current_cooldown: base_cooldown,
            failure_window: VecDeque::with_capacity(CIRCUIT_BREAKER_FAILS + 1),
            circuit_tripped: false,
        }
    }

    pub fn signal_restart(&mut self) {
        self.restart_needed = true;
    }

    pub fn can_retry(&self) -> bool {
        Instant::now() >= self.next_retry_time && self.restart_needed
    }

    /// Exponential backoff: cooldown *= 1.5 each failure, capped at 30s.
    pub fn record_failed_attempt(&mut self) {
        self.attempts += 1;
        self.record_failure_window();

        self.current_cooldown =
            Duration::from_secs_f64((self.current_cooldown.as_secs_f64() * 1.5).min(30.0));
        self.next_retry_time = Instant::now() + self.current_cooldown;

        log::warn!(
            "{} restart attempt {} failed, next retry in {:.1}s",
            self.name,
            self.attempts,
            self.current_cooldown.as_secs_f64()
        );
    }

    pub fn record_success(&mut self) {
        log::info!(
            "{} restarted successfully after {} attempt(s)",
            self.name,
            self.attempts
        );
        self.restart_needed = false;
        self.attempts = 0;
        self.current_cooldown = self.base_cooldown;
        self.next_retry_time = Instant::now();
        self.failure_window.clear();
        self.circuit_tripped = false;
    }

    pub fn can_restart(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn circuit_tripped(&self) -> bool {
        self.circuit_tripped
    }

    fn record_failure_window(&mut self) {
        let now = Instant::now();
        self.failure_window.push_back(now);

        while let Some(front) = self.failure_window.front() {
            if now.duration_since(*front) > CIRCUIT_BREAKER_WINDOW {
                self.failure_window.pop_front();
            } else {
                break;
            }
        }

        if self.failure_window.len() >= CIRCUIT_BREAKER_FAILS {
            self.circuit_tripped = true;
            self.restart_needed = false;
            log::error!(
                "{} circuit breaker tripped ({} failures in {:.0?}); shutting down restarts",
                self.name,
                self.failure_window.len(),
                CIRCUIT_BREAKER_WINDOW
            );
        }
    }
}

/// Restart state for all three supervised sensor streams.
pub struct RestartManager {
    pub accel: Arc<Mutex<RestartState>>,
    pub gyro: Arc<Mutex<RestartState>>,
    pub gps: Arc<Mutex<RestartState>>,
}

impl RestartManager {
    pub fn new() -> Self {
        RestartManager {
            accel: Arc::new(Mutex::new(RestartState::new("accel", 60, 2))),
            gyro: Arc::new(Mutex::new(RestartState::new("gyro", 60, 2))),
            gps: Arc::new(Mutex::new(RestartState::new("gps", 60, 2))),
        }
    }

    pub fn signal_accel_restart(&self) {
        if let Ok(mut state) = self.accel.lock() {
            if !state.restart_needed {
                log::info!("signaling accel restart");
                state.signal_restart();
            }
        }
    }

    pub fn signal_gyro_restart(&self) {
        if let Ok(mut state) = self.gyro.lock() {
            if !state.restart_needed {
                log::info!("signaling gyro restart");
                state.signal_restart();
            }
        }
    }

    pub fn signal_gps_restart(&self) {
        if let Ok(mut state) = self.gps.lock() {
            if !state.restart_needed {
                log::info!("signaling gps restart");
                state.signal_restart();
            }
        }
    }

    pub fn accel_ready_restart(&self) -> bool {
        self.accel
            .lock()
            .ok()
            .map(|s| s.can_retry() && s.can_restart() && !s.circuit_tripped())
            .unwrap_or(false)
    }

    pub fn gyro_ready_restart(&self) -> bool {
        self.gyro
            .lock()
            .ok()
            .map(|s| s.can_retry() && s.can_restart() && !s.circuit_tripped())
            .unwrap_or(false)
    }

    pub fn gps_ready_restart(&self) -> bool {
        self.gps
            .lock()
            .ok()
            .map(|s| s.can_retry() && s.can_restart() && !s.circuit_tripped())
            .unwrap_or(false)
    }

    pub fn accel_restart_success(&self) {
        if let Ok(mut state) = self.accel.lock() {
            state.record_success();
        }
    }

    pub fn gyro_restart_success(&self) {
        if let Ok(mut state) = self.gyro.lock() {
            state.record_success();
        }
    }

    pub fn gps_restart_success(&self) {
        if let Ok(mut state) = self.gps.lock() {
            state.record_success();
        }
    }

    pub fn accel_restart_failed(&self) {
        if let Ok(mut state) = self.accel.lock() {
            state.record_failed_attempt();
        }
    }

    pub fn gyro_restart_failed(&self) {
        if let Ok(mut state) = self.gyro.lock() {
            state.record_failed_attempt();
        }
    }

    pub fn gps_restart_failed(&self) {
        if let Ok(mut state) = self.gps.lock() {
            state.record_failed_attempt();
        }
    }

    pub fn any_circuit_tripped(&self) -> bool {
        self.accel_circuit_tripped() || self.gyro_circuit_tripped() || self.gps_circuit_tripped()
    }

    pub fn accel_circuit_tripped(&self) -> bool {
        self.accel
            .lock()
            .ok()
            .map(|s| s.circuit_tripped())
            .unwrap_or(false)
    }

    pub fn gyro_circuit_tripped(&self) -> bool {
        self.gyro
            .lock()
            .ok()
            .map(|s| s.circuit_tripped())
            .unwrap_or(false)
    }

    pub fn gps_circuit_tripped(&self) -> bool {
        self.gps
            .lock()
            .ok()
            .map(|s| s.circuit_tripped())
            .unwrap_or(false)
    }
}

impl Default for RestartManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_grows_each_failed_attempt() {
        let mut state = RestartState::new("test", 5, 1);
        state.signal_restart();
        assert!(state.can_retry());

        state.record_failed_attempt();
        let cooldown1 = state.current_cooldown.as_secs_f64();
        assert!((1.0..2.0).contains(&cooldown1));

        state.record_failed_attempt();
        assert!(state.current_cooldown.as_secs_f64() > cooldown1);
    }

    #[test]
    fn max_attempts_eventually_blocks_restart() {
        let mut state = RestartState::new("test", 2, 1);
        state.signal_restart();
        assert!(state.can_restart());
        state.record_failed_attempt();
        assert!(state.can_restart());
        state.record_failed_attempt();
        assert!(!state.can_restart());
    }

    #[test]
    fn circuit_breaker_trips_after_five_failures_in_window() {
        let mut state = RestartState::new("test", 10, 1);
        state.signal_restart();
        for _ in 0..CIRCUIT_BREAKER_FAILS {
            state.record_failed_attempt();
        }
        assert!(state.circuit_tripped());
        assert!(!state.restart_needed);
    }

    #[test]
    fn restart_manager_tracks_success_and_resets_attempts() {
        let manager = RestartManager::new();
        manager.signal_accel_restart();
        assert!(manager.accel_ready_restart());

        manager.accel_restart_success();
        let state = manager.accel.lock().unwrap();
        assert!(!state.restart_needed);
        assert_eq!(state.attempts, 0);
    }
}
