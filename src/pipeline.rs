use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::calibration::CalibrationHandle;
use crate::config::{Config, TuningConfig};
use crate::crash_log::CrashLog;
use crate::derived;
use crate::filters::es_ekf::EsEkf;
use crate::filters::linear_kf::LinearKf;
use crate::health::{health_monitor_task, HealthMonitor};
use crate::incident::IncidentDetector;
use crate::recorder::Recorder;
use crate::restart::RestartManager;
use crate::types::{AccelSample, FusedReading, GpsFix, GyroSample};
use crate::zupt::StationaryDetector;

/// One input event, tagged with its kind so `FusionEngine::handle_event`
/// can apply the right update without the caller needing to know the
/// filters' internals. The sole ordering truth across event kinds is
/// `timestamp()` (spec.md 4.D) — `FusionEngine` enforces strict
/// monotonicity itself and discards stale events.
#[derive(Clone, Debug)]
pub enum SensorEvent {
    Accel(AccelSample),
    Gyro(GyroSample),
    Gps(GpsFix),
}

impl SensorEvent {
    pub fn timestamp(&self) -> f64 {
        match self {
            SensorEvent::Accel(s) => s.timestamp,
            SensorEvent::Gyro(s) => s.timestamp,
            SensorEvent::Gps(s) => s.timestamp,
        }
    }
}

/// Timestamps older than the last-applied timestamp by more than this are
/// discarded outright (spec.md invariant 1); timestamps within it are
/// treated as "the same tick" for tie-break purposes (GPS before accel,
/// spec.md 4.E).
const TIMESTAMP_EPSILON: f64 = 1e-9;

/// What one `FusionEngine::handle_event` call produced: always a fused
/// reading (when the event wasn't discarded as stale), plus an incident
/// record on the (rare) tick that triggers one.
pub struct TickOutcome {
    pub reading: FusedReading,
    pub incident: Option<crate::types::IncidentRecord>,
}

/// The one canonical fusion step, shared verbatim between the online
/// pipeline and the deterministic replay runner (`replay.rs`) — spec.md 9's
/// "one canonical implementation" note applied to the whole pipeline, not
/// just the Kalman math. Owns both filters, the calibration profile, the
/// stationary detector, and the incident detector; `handle_event` is the
/// only entry point, so online and replay can never drift apart in how a
/// sample is turned into a `FusedReading`.
pub struct FusionEngine {
    profile: Arc<crate::types::CalibrationProfile>,
    linear_kf: LinearKf,
    es_ekf: EsEkf,
    stationary: StationaryDetector,
    incidents: IncidentDetector,
    tuning: TuningConfig,
    last_timestamp: f64,
    last_gyro_z: f64,
    last_longitudinal_accel: f64,
    last_accel_magnitude: f64,
    last_speed: f64,
    recalibration_accel: VecDeque<AccelSample>,
    recalibration_gyro: VecDeque<GyroSample>,
    last_recalibration: f64,
    pending_profile: Option<crate::types::CalibrationProfile>,
}

impl FusionEngine {
    pub fn new(profile: Arc<crate::types::CalibrationProfile>, tuning: TuningConfig) -> Self {
        Self {
            linear_kf: LinearKf::new(tuning.gps_sigma_min, tuning.gps_sigma_max, tuning.q_accel),
            es_ekf: EsEkf::new(
                tuning.gravity_well_decay_per_sec,
                tuning.q_heading,
                tuning.q_heading_rate,
                tuning.q_accel_bias,
                tuning.q_gyro_bias,
            ),
            stationary: StationaryDetector::new(&tuning),
            incidents: IncidentDetector::new(&tuning),
            last_recalibration: profile.created_at,
            recalibration_accel: VecDeque::with_capacity(tuning.calibration_min_samples),
            recalibration_gyro: VecDeque::with_capacity(tuning.calibration_min_samples),
            pending_profile: None,
            profile,
            tuning,
            last_timestamp: 0.0,
            last_gyro_z: 0.0,
            last_longitudinal_accel: 0.0,
            last_accel_magnitude: 0.0,
            last_speed: 0.0,
        }
    }

    /// Take the profile produced by the most recent opportunistic
    /// recalibration, if any occurred since the last call. `handle_event`
    /// already applies it to this engine's own fusion math; the caller only
    /// needs this to republish the fresh profile to other `CalibrationHandle`
    /// readers (spec.md 4.G).
    pub fn take_recalibrated_profile(&mut self) -> Option<crate::types::CalibrationProfile> {
        self.pending_profile.take()
    }

    fn predict_to(&mut self, timestamp: f64, body_accel_xy: Option<(f64, f64)>) {
        let dt = timestamp - self.last_timestamp;
        if dt <= 0.0 {
            return;
        }
        self.linear_kf.predict(dt);
        self.es_ekf.predict(dt, body_accel_xy);
        self.last_timestamp = timestamp;
    }

    /// Apply one event, returning the `TickOutcome` for this tick, or
    /// `None` if the event was discarded as stale (invariant 1).
    pub fn handle_event(&mut self, event: SensorEvent) -> Option<TickOutcome> {
        let ts = event.timestamp();
        if ts < self.last_timestamp - TIMESTAMP_EPSILON {
            log::debug!("discarding stale event at t={ts:.6} (last applied {:.6})", self.last_timestamp);
            return None;
        }

        let mut accel_sample = None;
        let mut gyro_sample = None;
        let mut gps_sample = None;

        match event {
            SensorEvent::Accel(sample) => {
                let (motion_magnitude, corrected) = self.profile.calibrated_accel(&sample);
                self.predict_to(ts, Some((corrected[0], corrected[1])));

                let heading = self.es_ekf.snapshot().heading;
                let world_ax = corrected[0] * heading.cos() - corrected[1] * heading.sin();
                let world_ay = corrected[0] * heading.sin() + corrected[1] * heading.cos();
                self.linear_kf
                    .update_accel(ts, world_ax, world_ay, self.tuning.q_accel.powi(2));

                self.last_accel_magnitude = motion_magnitude;
                // Project world-frame accel onto the heading direction so
                // "longitudinal" means forward/backward along travel, not
                // world-x (spec.md 4.H's hard-braking threshold is defined
                // along the vehicle's direction of travel).
                self.last_longitudinal_accel = world_ax * heading.cos() + world_ay * heading.sin();
                self.stationary.push_accel_magnitude(ts, sample.magnitude());
                self.stationary.apply(&mut self.es_ekf, ts);
                push_bounded(&mut self.recalibration_accel, sample, self.tuning.calibration_min_samples);
                self.maybe_recalibrate(ts);
                accel_sample = Some(sample);
            }
            SensorEvent::Gyro(sample) => {
                self.predict_to(ts, None);
                let calibrated = self.profile.calibrated_gyro(&sample);
                let gyro_magnitude =
                    (calibrated[0].powi(2) + calibrated[1].powi(2) + calibrated[2].powi(2)).sqrt();
                self.stationary.observe_gyro_magnitude(gyro_magnitude);
                self.es_ekf.update_gyro_z(ts, sample.wz, 0.01);
                self.last_gyro_z = calibrated[2];
                push_bounded(&mut self.recalibration_gyro, sample, self.tuning.calibration_min_samples);
                gyro_sample = Some(sample);
            }
            SensorEvent::Gps(fix) => {
                self.predict_to(ts, None);
                self.stationary.observe_gps_speed(ts, fix.speed);

                let sigma = fix.accuracy.clamp(self.tuning.gps_sigma_min, self.tuning.gps_sigma_max);
                let mahalanobis = self
                    .es_ekf
                    .gps_mahalanobis(fix.latitude, fix.longitude, sigma);
                let gated = mahalanobis
                    .map(|d| d > self.tuning.mahalanobis_gate)
                    .unwrap_or(false);

                if gated {
                    log::warn!(
                        "gps update rejected at t={ts:.3}: innovation {:.1}sigma exceeds gate",
                        mahalanobis.unwrap_or(f64::INFINITY)
                    );
                } else {
                    self.es_ekf
                        .update_gps(ts, fix.latitude, fix.longitude, fix.altitude, sigma);

                    if let Some((ex, ey)) = self.es_ekf.project_enu(fix.latitude, fix.longitude) {
                        self.linear_kf.update_position(ts, ex, ey, sigma);
                    }
                }
                gps_sample = Some(fix);
            }
        }

        self.clamp_numerical_safeguards();
        self.last_speed = self.es_ekf.speed();

        let incident = self.incidents.check(
            ts,
            self.last_longitudinal_accel,
            self.last_accel_magnitude,
            self.last_gyro_z,
            gps_sample.as_ref().and_then(|g| g.speed),
        );
        if let Some(incident) = &incident {
            log::warn!(
                "incident detected: {:?} magnitude={:.2} at t={:.3}",
                incident.event_type,
                incident.magnitude,
                incident.trigger_timestamp
            );
        }

        let power = derived::specific_power_w_per_kg(self.last_speed, self.last_longitudinal_accel);
        let reading = FusedReading {
            timestamp: ts,
            accel: accel_sample,
            gyro: gyro_sample,
            gps: gps_sample,
            ekf_6d: Some(self.linear_kf.snapshot()),
            experimental_15d: Some(self.es_ekf.snapshot()),
            specific_power_w_per_kg: power,
        };

        Some(TickOutcome { reading, incident })
    }

    /// Opportunistic recalibration while stationary (spec.md 4.G): once the
    /// stationary detector has settled and the cooldown has elapsed, refit
    /// gravity/bias from the recent accel/gyro window and swap it in
    /// immediately. Deterministic (a pure function of buffered samples and
    /// `ts`), so replay stays bit-identical given the same input log.
    fn maybe_recalibrate(&mut self, ts: f64) {
        if !self.stationary.is_stationary() {
            return;
        }
        if ts - self.last_recalibration < self.tuning.recalibration_cooldown_secs {
            return;
        }
        if self.recalibration_accel.len() < self.tuning.calibration_min_samples {
            return;
        }

        let accel: Vec<AccelSample> = self.recalibration_accel.iter().copied().collect();
        let gyro: Vec<GyroSample> = self.recalibration_gyro.iter().copied().collect();
        match crate::calibration::calibrate(&accel, &gyro, ts, &self.tuning) {
            Ok(profile) => {
                log::info!(
                    "opportunistic recalibration at t={ts:.3}: gravity={:.3} variance={:.5}",
                    profile.gravity_magnitude,
                    profile.variance
                );
                self.last_recalibration = ts;
                self.profile = Arc::new(profile.clone());
                self.pending_profile = Some(profile);
            }
            Err(e) => log::debug!("opportunistic recalibration skipped at t={ts:.3}: {e}"),
        }
    }

    fn clamp_numerical_safeguards(&mut self) {
        if self.es_ekf.clamp_trace(self.tuning.max_covariance_trace) {
            log::warn!("ES-EKF covariance trace exceeded max, rescaled");
        }
        if self.es_ekf.clamp_speed(self.tuning.max_speed) {
            log::warn!(
                "ES-EKF speed exceeded max_speed ({:.1} m/s), clamped",
                self.tuning.max_speed
            );
        }
    }

    /// Push a raw accel/gyro/GPS sample into the incident detector's
    /// context buffers without running a fusion step. Used by the
    /// pipeline/replay drivers so the buffer always has the full raw
    /// stream even on stale-discarded ticks.
    pub fn buffer_accel(&mut self, sample: AccelSample) {
        self.incidents.push_accel(sample);
    }

    pub fn buffer_gyro(&mut self, sample: GyroSample) {
        self.incidents.push_gyro(sample);
    }

    pub fn buffer_gps(&mut self, fix: GpsFix) {
        self.incidents.push_gps(fix);
    }
}

/// A single broadcast stop signal: every worker checks `is_stopped()` at
/// each suspension point and `notified()` lets a blocked `recv_batch`
/// wake immediately rather than waiting for its next item (spec.md 5).
#[derive(Clone)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_stopped() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires components A-I together for the online (non-replay) run: spawns
/// one worker per responsibility (§5), drives them off the bus, and runs
/// until `stop` fires or `duration_secs` elapses. Grounded in the
/// teacher's `main()` task-spawning section, minus the dashboard/rerun
/// spawns.
pub async fn run_online(
    config: Config,
    calibration: CalibrationHandle,
    stop: StopSignal,
    crash_log: CrashLog,
) -> anyhow::Result<()> {
    let tuning = config.tuning.clone();
    let accel_bus = Arc::new(crate::bus::Bus::<AccelSample>::new(tuning.accel_queue_capacity));
    let gyro_bus = Arc::new(crate::bus::Bus::<GyroSample>::new(tuning.accel_queue_capacity));
    let gps_bus = Arc::new(crate::bus::Bus::<GpsFix>::new(tuning.gps_queue_capacity));

    let health = Arc::new(HealthMonitor::new(&tuning));
    let restart = Arc::new(RestartManager::new());

    let accel_sub = accel_bus.subscribe(None);
    let gyro_sub = gyro_bus.subscribe(None);
    let gps_sub = gps_bus.subscribe(None);

    let session_dir = config.session_dir.clone();
    std::fs::create_dir_all(&session_dir)?;
    let recorder = Arc::new(std::sync::Mutex::new(Recorder::new(&session_dir)));

    // Sensor daemon supervisor: restarts the IMU subprocess with
    // exponential backoff, bailing out entirely once its circuit breaker
    // trips (spec.md 4.A failure-mode list).
    {
        let accel_bus = accel_bus.clone();
        let gyro_bus_opt = if config.enable_gyro { Some(gyro_bus.clone()) } else { None };
        let accel_health = Arc::new(health.accel.clone());
        let gyro_health = Arc::new(health.gyro.clone());
        let restart = restart.clone();
        let stop = stop.clone();
        let accel_period_ms = config.accel_period_ms;
        tokio::spawn(async move {
            while !stop.is_stopped() {
                if restart.any_circuit_tripped() {
                    log::error!("imu circuit breaker tripped; supervisor exiting");
                    break;
                }
                if !restart.accel_ready_restart() && restart.accel.lock().unwrap().restart_needed {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                match crate::sensor_daemon::run_imu_daemon(
                    accel_bus.clone(),
                    gyro_bus_opt.clone(),
                    accel_health.clone(),
                    gyro_health.clone(),
                    accel_period_ms,
                )
                .await
                {
                    Ok(()) => restart.accel_restart_success(),
                    Err(e) => {
                        log::warn!("imu daemon exited: {e}");
                        restart.accel_restart_failed();
                        restart.gyro_restart_failed();
                    }
                }
                restart.signal_accel_restart();
                restart.signal_gyro_restart();
            }
        });
    }

    {
        let gps_bus = gps_bus.clone();
        let gps_health = Arc::new(health.gps.clone());
        let stop = stop.clone();
        let poll_period = Duration::from_secs_f64(config.gps_poll_period_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = crate::gps_source::run_gps_source(gps_bus, gps_health, poll_period) => {}
                _ = stop.wait() => {}
            }
        });
    }

    {
        let health = health.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = health_monitor_task(health) => {}
                _ = stop.wait() => {}
            }
        });
    }

    let flush_period = Duration::from_secs_f64(tuning.flush_period_secs);
    {
        let recorder = recorder.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(flush_period) => {
                        recorder.lock().unwrap().flush(None);
                    }
                    _ = stop.wait() => break,
                }
            }
        });
    }

    let profile = calibration.load();
    let mut engine = FusionEngine::new(profile, tuning);

    let deadline = if config.duration_secs > 0 {
        Some(tokio::time::Instant::now() + Duration::from_secs(config.duration_secs))
    } else {
        None
    };

    loop {
        if stop.is_stopped() {
            break;
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                stop.stop();
                break;
            }
        }

        tokio::select! {
            batch = accel_sub.recv_batch() => {
                for sample in batch {
                    engine.buffer_accel(sample);
                    if let Some(outcome) = engine.handle_event(SensorEvent::Accel(sample)) {
                        record_outcome(&recorder, outcome, config.enable_incident_detector);
                    }
                }
            }
            batch = gyro_sub.recv_batch(), if config.enable_gyro => {
                for sample in batch {
                    engine.buffer_gyro(sample);
                    if let Some(outcome) = engine.handle_event(SensorEvent::Gyro(sample)) {
                        record_outcome(&recorder, outcome, config.enable_incident_detector);
                    }
                }
            }
            batch = gps_sub.recv_batch() => {
                for fix in batch {
                    engine.buffer_gps(fix);
                    if let Some(outcome) = engine.handle_event(SensorEvent::Gps(fix)) {
                        record_outcome(&recorder, outcome, config.enable_incident_detector);
                    }
                }
            }
            _ = stop.wait() => break,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        if let Some(profile) = engine.take_recalibrated_profile() {
            calibration.republish(profile);
        }
    }

    log::info!("shutting down, flushing final session log");
    let final_recorder = recorder.lock().unwrap();
    final_recorder.flush(Some(&crash_log));
    Ok(())
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    if buffer.len() >= capacity.max(1) {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

fn record_outcome(
    recorder: &std::sync::Mutex<Recorder>,
    outcome: TickOutcome,
    enable_incident_detector: bool,
) {
    let mut r = recorder.lock().unwrap();
    r.push_reading(outcome.reading);
    if enable_incident_detector {
        if let Some(incident) = outcome.incident {
            r.flush_incident(&incident);
            r.push_incident(incident);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CalibrationProfile;

    fn profile() -> Arc<CalibrationProfile> {
        Arc::new(CalibrationProfile {
            accel_bias: [0.0, 0.0, 0.0],
            gravity_magnitude: 9.81,
            gyro_bias: [0.0, 0.0, 0.0],
            created_at: 0.0,
            sample_count: 100,
            variance: 0.001,
        })
    }

    #[test]
    fn opportunistic_recalibration_fires_once_stationary_past_cooldown() {
        let mut tuning = TuningConfig::from_defaults();
        tuning.recalibration_cooldown_secs = 0.3;
        tuning.calibration_min_samples = 20;
        let mut engine = FusionEngine::new(profile(), tuning);

        let mut fired = false;
        for i in 1..80 {
            let t = i as f64 * 0.02;
            let sample = AccelSample {
                timestamp: t,
                x: 0.0,
                y: 0.0,
                z: 9.81,
            };
            engine.buffer_accel(sample);
            engine.handle_event(SensorEvent::Accel(sample));
            if engine.take_recalibrated_profile().is_some() {
                fired = true;
            }
        }
        assert!(fired);
    }

    #[test]
    fn recalibration_does_not_fire_before_min_samples_buffered() {
        let mut tuning = TuningConfig::from_defaults();
        tuning.recalibration_cooldown_secs = 0.0;
        tuning.calibration_min_samples = 1000;
        let mut engine = FusionEngine::new(profile(), tuning);

        for i in 1..40 {
            let t = i as f64 * 0.02;
            let sample = AccelSample {
                timestamp: t,
                x: 0.0,
                y: 0.0,
                z: 9.81,
            };
            engine.buffer_accel(sample);
            engine.handle_event(SensorEvent::Accel(sample));
            assert!(engine.take_recalibrated_profile().is_none());
        }
    }

    #[test]
    fn corrupted_accel_spike_saturates_speed_at_max_speed() {
        let tuning = TuningConfig::from_defaults();
        let max_speed = tuning.max_speed;
        let mut engine = FusionEngine::new(profile(), tuning);

        // 5 seconds of a 50 m/s^2 spike along x, heading starts at 0.
        for i in 1..=250 {
            let t = i as f64 * 0.02;
            let sample = AccelSample {
                timestamp: t,
                x: 50.0,
                y: 0.0,
                z: 9.81,
            };
            engine.buffer_accel(sample);
            let outcome = engine.handle_event(SensorEvent::Accel(sample)).unwrap();
            let speed = outcome.reading.experimental_15d.unwrap().speed();
            assert!(speed <= max_speed + 1e-6, "speed {speed} exceeded max_speed {max_speed}");
            assert!(speed.is_finite());
        }
    }
}
