use std::path::PathBuf;

use clap::Parser;
use drivetrace_fusion::config::TuningConfig;
use drivetrace_fusion::{calibration, replay};
use serde_json::json;

/// Re-drive a recorded `comparison_*.json[.gz]` session log through the
/// same fusion engine the online binary uses, and report how closely the
/// result tracked raw GPS speed. Grounded on the teacher's `bin/replay.rs`
/// (`load_log`/`rmse_pairs`/`json!` summary), generalized to drive the
/// shared `FusionEngine` instead of a standalone 15-state EKF, and with a
/// `--gps-decimation` knob the teacher's binary lacked.
#[derive(Parser, Debug)]
#[command(name = "drivetrace-replay")]
struct Args {
    /// Path to a comparison_*.json[.gz] log written by the online binary.
    #[arg(long)]
    log: PathBuf,

    /// Keep every Nth GPS fix during replay and drop the rest.
    #[arg(long)]
    gps_decimation: Option<u32>,

    /// Seconds of the log's leading samples used to recompute calibration
    /// (there is no live device to hold still during replay).
    #[arg(long, default_value = "3.0")]
    calibration_duration_secs: f64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let log = replay::load_session_log(&args.log)?;
    let tuning = TuningConfig::from_defaults();

    let mut accel_samples = Vec::new();
    let mut gyro_samples = Vec::new();
    let cutoff = log
        .readings
        .first()
        .map(|r| r.timestamp + args.calibration_duration_secs)
        .unwrap_or(args.calibration_duration_secs);
    for reading in &log.readings {
        if reading.timestamp > cutoff {
            break;
        }
        if let Some(accel) = reading.accel {
            accel_samples.push(accel);
        }
        if let Some(gyro) = reading.gyro {
            gyro_samples.push(gyro);
        }
    }
    let profile = calibration::calibrate(&accel_samples, &gyro_samples, 0.0, &tuning)?;

    let output = replay::replay(&log, profile, tuning, args.gps_decimation);

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
    let max_fused = output
        .readings
        .iter()
        .filter_map(|r| r.experimental_15d)
        .map(|e| e.speed())
        .fold(0.0_f64, f64::max);
    let max_gps = output
        .readings
        .iter()
        .filter_map(|r| r.gps.and_then(|g| g.speed))
        .fold(0.0_f64, f64::max);

    let summary = json!({
        "log": args.log.display().to_string(),
        "gps_decimation": args.gps_decimation,
        "rmse": rmse,
        "max_fused_speed": max_fused,
        "max_gps_speed": max_gps,
        "readings": output.readings.len(),
        "incidents": output.incidents.len(),
        "pairs": paired.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
