use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use drivetrace_fusion::bus::Bus;
use drivetrace_fusion::calibration::{self, CalibrationHandle};
use drivetrace_fusion::config::Config;
use drivetrace_fusion::crash_log::CrashLog;
use drivetrace_fusion::health::SensorHealth;
use drivetrace_fusion::pipeline::{self, StopSignal};
use drivetrace_fusion::replay;
use drivetrace_fusion::types::{AccelSample, GyroSample};

/// Thin CLI entry point: parse `Config`, calibrate (or load a replay log),
/// then hand off to `pipeline::run_online` or `replay::replay`. All of the
/// actual work lives in the library crate so the replay binary
/// (`bin/replay.rs`) and tests can drive the same code paths.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();

    std::fs::create_dir_all(&config.session_dir)?;
    let crash_log = CrashLog::new(&config.session_dir);
    crash_log.clone().install_panic_hook();

    if let Some(log_path) = config.replay_log_path.clone() {
        return run_replay(&config, &log_path);
    }

    log::info!("holding still for {:.1}s calibration window", config.calibration_duration_secs);
    let profile = match run_calibration(&config).await {
        Ok(profile) => profile,
        Err(e) => {
            crash_log.write_record(&format!("calibration failed: {e}"))?;
            anyhow::bail!(e);
        }
    };
    log::info!(
        "calibration complete: gravity={:.3} bias={:?} variance={:.5}",
        profile.gravity_magnitude,
        profile.accel_bias,
        profile.variance
    );

    let calibration = CalibrationHandle::new(profile);
    let stop = StopSignal::new();

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("ctrl-c received, shutting down");
                stop.stop();
            }
        });
    }

    pipeline::run_online(config, calibration, stop, crash_log).await
}

/// Collect a short stationary window of accel/gyro samples through the
/// same IMU daemon the steady-state pipeline uses, then fold them into a
/// `CalibrationProfile` via `calibration::calibrate`. The daemon spawned
/// here is aborted once the window closes; `pipeline::run_online` starts
/// its own supervised daemon for the tracking run proper.
async fn run_calibration(config: &Config) -> anyhow::Result<drivetrace_fusion::types::CalibrationProfile> {
    let accel_bus = Arc::new(Bus::<AccelSample>::new(config.tuning.accel_queue_capacity));
    let gyro_bus = Arc::new(Bus::<GyroSample>::new(config.tuning.accel_queue_capacity));
    let accel_health = Arc::new(SensorHealth::new("accel-calibration", 5, 1));
    let gyro_health = Arc::new(SensorHealth::new("gyro-calibration", 5, 1));

    let accel_sub = accel_bus.subscribe(None);
    let gyro_sub = gyro_bus.subscribe(None);

    let daemon = tokio::spawn(drivetrace_fusion::sensor_daemon::run_imu_daemon(
        accel_bus.clone(),
        Some(gyro_bus.clone()),
        accel_health,
        gyro_health,
        config.accel_period_ms,
    ));

    let mut accel_samples = Vec::new();
    let mut gyro_samples = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(config.calibration_duration_secs);

    loop {
        tokio::select! {
            batch = accel_sub.recv_batch() => accel_samples.extend(batch),
            batch = gyro_sub.recv_batch() => gyro_samples.extend(batch),
            _ = tokio::time::sleep_until(deadline) => break,
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
    }
    daemon.abort();

    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    calibration::calibrate(&accel_samples, &gyro_samples, now, &config.tuning)
}

/// Replay mode: calibrate from the log's own leading stationary window
/// (there is no live device to hold still), re-drive it deterministically,
/// and report a GPS-speed RMSE summary (teacher's `bin/replay.rs` output).
fn run_replay(config: &Config, log_path: &str) -> anyhow::Result<()> {
    let log = replay::load_session_log(log_path)?;

    let mut accel_samples = Vec::new();
    let mut gyro_samples = Vec::new();
    let calibration_cutoff = log
        .readings
        .first()
        .map(|r| r.timestamp + config.calibration_duration_secs)
        .unwrap_or(config.calibration_duration_secs);
    for reading in &log.readings {
        if reading.timestamp > calibration_cutoff {
            break;
        }
        if let Some(accel) = reading.accel {
            accel_samples.push(accel);
        }
        if let Some(gyro) = reading.gyro {
            gyro_samples.push(gyro);
        }
    }
    let profile = calibration::calibrate(&accel_samples, &gyro_samples, 0.0, &config.tuning)?;

    let output = replay::replay(&log, profile, config.tuning.clone(), config.gps_decimation);

    let paired: Vec<(f64, f64)> = output
        .readings
        .iter()
        .filter_map(|r| {
            let gps = r.gps?;
            let speed = gps.speed?;
            let fused = r.experimental_15d?.speed();
            Some((fused, speed))
        })
        .collect();
    let rmse = replay::rmse_pairs(&paired);

    log::info!(
        "replay complete: {} readings, {} incidents, gps-speed rmse={:.3}",
        output.readings.len(),
        output.incidents.len(),
        rmse
    );

    let out_path = std::path::Path::new(&config.session_dir).join("replay_output.json");
    std::fs::write(&out_path, serde_json::to_string_pretty(&output)?)?;
    log::info!("wrote {}", out_path.display());

    Ok(())
}
