use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::config::TuningConfig;
use crate::pipeline::{FusionEngine, SensorEvent};
use crate::types::{CalibrationProfile, SessionLog};

/// Read a `comparison_*.json[.gz]` session log, transparently decompressing
/// when the extension is `.gz`. Grounded on the teacher's `bin/replay.rs::load_log`.
pub fn load_session_log(path: impl AsRef<Path>) -> anyhow::Result<SessionLog> {
    let path = path.as_ref();
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Flatten a recorded log's readings back into the ordered event stream
/// `FusionEngine::handle_event` expects, applying `gps_decimation` (keep
/// every Nth fix, dropping the rest) along the way. A reading can carry more
/// than one sample kind at once (they were fused together on the original
/// run), so each becomes its own event in gps/gyro/accel order — the same
/// GPS-before-accel tie-break `pipeline.rs` documents for ticks that land on
/// the same timestamp (spec.md 4.E).
fn events_from_log(log: &SessionLog, gps_decimation: Option<u32>) -> Vec<SensorEvent> {
    let stride = gps_decimation.unwrap_or(1).max(1);
    let mut gps_index: u32 = 0;
    let mut events = Vec::new();

    for reading in &log.readings {
        if let Some(gps) = reading.gps {
            let keep = gps_index % stride == 0;
            gps_index += 1;
            if keep {
                events.push(SensorEvent::Gps(gps));
            }
        }
        if let Some(gyro) = reading.gyro {
            events.push(SensorEvent::Gyro(gyro));
        }
        if let Some(accel) = reading.accel {
            events.push(SensorEvent::Accel(accel));
        }
    }

    events
}

/// Deterministically re-drive a recorded session log through a fresh
/// `FusionEngine`, producing a brand-new `SessionLog` of fused output.
/// Because `handle_event` is the single canonical fusion step shared with
/// the online pipeline, and nothing here reads wall-clock time or any other
/// outside-world state, two calls with the same log and the same
/// `CalibrationProfile`/`TuningConfig` always produce byte-identical
/// readings (spec.md 8's replay-determinism property).
pub fn replay(
    log: &SessionLog,
    profile: CalibrationProfile,
    tuning: TuningConfig,
    gps_decimation: Option<u32>,
) -> SessionLog {
    let mut engine = FusionEngine::new(std::sync::Arc::new(profile), tuning);
    let events = events_from_log(log, gps_decimation);

    let mut readings = Vec::with_capacity(events.len());
    let mut incidents = Vec::new();
    let mut accel_samples = 0u64;
    let mut gyro_samples = 0u64;
    let mut gps_fixes = 0u64;

    for event in events {
        match &event {
            SensorEvent::Accel(s) => engine.buffer_accel(*s),
            SensorEvent::Gyro(s) => engine.buffer_gyro(*s),
            SensorEvent::Gps(s) => engine.buffer_gps(*s),
        }
        if let Some(outcome) = engine.handle_event(event) {
            if outcome.reading.accel.is_some() {
                accel_samples += 1;
            }
            if outcome.reading.gyro.is_some() {
                gyro_samples += 1;
            }
            if outcome.reading.gps.is_some() {
                gps_fixes += 1;
            }
            if let Some(incident) = outcome.incident {
                incidents.push(incident);
            }
            readings.push(outcome.reading);
        }
    }

    SessionLog {
        readings,
        trajectories: Vec::new(),
        incidents,
        metadata: crate::types::SessionMetadata {
            version: crate::types::SESSION_LOG_VERSION,
            source: "drivetrace-replay".to_string(),
            accel_samples,
            gyro_samples,
            gps_fixes,
        },
    }
}

/// Root-mean-square error between paired `(fused_speed, gps_speed)` values,
/// used by `bin/replay.rs` to report how closely the replayed fusion output
/// tracked raw GPS speed (teacher's `bin/replay.rs::rmse_pairs`, unchanged).
pub fn rmse_pairs(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return f64::INFINITY;
    }
    let sum_sq: f64 = pairs.iter().map(|(a, b)| (a - b).powi(2)).sum();
    (sum_sq / pairs.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccelSample, FusedReading, GpsFix, SessionMetadata};

    fn profile() -> CalibrationProfile {
        CalibrationProfile {
            accel_bias: [0.0, 0.0, 0.0],
            gravity_magnitude: 9.81,
            gyro_bias: [0.0, 0.0, 0.0],
            created_at: 0.0,
            sample_count: 100,
            variance: 0.001,
        }
    }

    fn synthetic_log() -> SessionLog {
        let mut readings = Vec::new();
        for i in 0..20 {
            let t = i as f64 * 0.1;
            readings.push(FusedReading {
                timestamp: t,
                accel: Some(AccelSample {
                    timestamp: t,
                    x: 0.2,
                    y: 0.0,
                    z: 9.81,
                }),
                gyro: None,
                gps: if i % 5 == 0 {
                    Some(GpsFix {
                        timestamp: t,
                        latitude: 37.0 + i as f64 * 1e-5,
                        longitude: -122.0,
                        altitude: None,
                        speed: Some(1.0),
                        bearing: None,
                        accuracy: 5.0,
                        source_timestamp: None,
                    })
                } else {
                    None
                },
                ekf_6d: None,
                experimental_15d: None,
                specific_power_w_per_kg: 0.0,
            });
        }
        SessionLog {
            readings,
            trajectories: Vec::new(),
            incidents: Vec::new(),
            metadata: SessionMetadata {
                version: SESSION_LOG_VERSION_FOR_TEST,
                source: "test".to_string(),
                accel_samples: 20,
                gyro_samples: 0,
                gps_fixes: 4,
            },
        }
    }

    const SESSION_LOG_VERSION_FOR_TEST: u32 = crate::types::SESSION_LOG_VERSION;

    #[test]
    fn replay_is_deterministic_across_runs() {
        let log = synthetic_log();
        let tuning = TuningConfig::from_defaults();
        let out1 = replay(&log, profile(), tuning.clone(), None);
        let out2 = replay(&log, profile(), tuning, None);

        assert_eq!(out1.readings.len(), out2.readings.len());
        for (a, b) in out1.readings.iter().zip(out2.readings.iter()) {
            assert_eq!(a.timestamp, b.timestamp);
            let ea = a.experimental_15d.unwrap();
            let eb = b.experimental_15d.unwrap();
            assert_eq!(ea.px, eb.px);
            assert_eq!(ea.py, eb.py);
            assert_eq!(ea.vx, eb.vx);
            assert_eq!(ea.vy, eb.vy);
        }
    }

    #[test]
    fn gps_decimation_keeps_every_nth_fix() {
        let log = synthetic_log();
        let tuning = TuningConfig::from_defaults();
        let full = replay(&log, profile(), tuning.clone(), None);
        let decimated = replay(&log, profile(), tuning, Some(2));

        assert_eq!(full.metadata.gps_fixes, 4);
        assert_eq!(decimated.metadata.gps_fixes, 2);
    }

    #[test]
    fn replay_produces_one_reading_per_retained_event() {
        let log = synthetic_log();
        let tuning = TuningConfig::from_defaults();
        let out = replay(&log, profile(), tuning, None);
        // 20 accel events + 4 gps events, none stale (distinct timestamps)
        assert_eq!(out.readings.len(), 24);
    }
}
