use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::crash_log::CrashLog;
use crate::types::{
    FusedReading, IncidentRecord, SessionLog, SessionMetadata, TrajectoryPoint,
    SESSION_LOG_VERSION,
};

/// ~5 meters in degrees at the equator, for thinning the trajectory
/// point list, grounded verbatim on the teacher's `build_track_path`
/// threshold.
const TRACK_POINT_THRESHOLD_DEG_SQ: f64 = 0.00005;

/// Accumulates `FusedReading`s in memory and flushes them to a
/// gzip-compressed session log on a periodic boundary or clean shutdown.
/// Grounded on the teacher's `save_json_compressed`/`build_track_path`
/// (atomic temp-then-rename write, same distance-thinned trajectory) plus
/// `SessionMetadata`/counts per spec.md 6's log schema.
pub struct Recorder {
    session_dir: PathBuf,
    readings: Vec<FusedReading>,
    trajectory: Vec<TrajectoryPoint>,
    incidents: Vec<IncidentRecord>,
    last_track_point: Option<[f64; 2]>,
    accel_samples: u64,
    gyro_samples: u64,
    gps_fixes: u64,
    started_at: String,
}

impl Recorder {
    pub fn new(session_dir: impl AsRef<Path>) -> Self {
        Self {
            session_dir: session_dir.as_ref().to_path_buf(),
            readings: Vec::new(),
            trajectory: Vec::new(),
            incidents: Vec::new(),
            last_track_point: None,
            accel_samples: 0,
            gyro_samples: 0,
            gps_fixes: 0,
            started_at: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    pub fn push_reading(&mut self, reading: FusedReading) {
        if reading.accel.is_some() {
            self.accel_samples += 1;
        }
        if reading.gyro.is_some() {
            self.gyro_samples += 1;
        }
        if let Some(gps) = &reading.gps {
            self.gps_fixes += 1;
            self.push_track_point(gps.latitude, gps.longitude, &reading);
        }
        self.readings.push(reading);
    }

    fn push_track_point(&mut self, lat: f64, lon: f64, reading: &FusedReading) {
        let current = [lat, lon];
        let far_enough = match self.last_track_point {
            None => true,
            Some(last) => {
                let dist_sq = (current[0] - last[0]).powi(2) + (current[1] - last[1]).powi(2);
                dist_sq >= TRACK_POINT_THRESHOLD_DEG_SQ
            }
        };
        if !far_enough {
            return;
        }
        self.last_track_point = Some(current);
        if let Some(ekf) = &reading.experimental_15d {
            self.trajectory.push(TrajectoryPoint {
                timestamp: reading.timestamp,
                ekf_x: ekf.px,
                ekf_y: ekf.py,
                ekf_velocity: ekf.speed(),
                ekf_heading_deg: ekf.heading.to_degrees(),
            });
        }
    }

    pub fn push_incident(&mut self, incident: IncidentRecord) {
        self.incidents.push(incident);
    }

    pub fn reading_count(&self) -> usize {
        self.readings.len()
    }

    fn session_log(&self) -> SessionLog {
        SessionLog {
            readings: self.readings.clone(),
            trajectories: self.trajectory.clone(),
            incidents: self.incidents.clone(),
            metadata: SessionMetadata {
                version: SESSION_LOG_VERSION,
                source: "drivetrace".to_string(),
                accel_samples: self.accel_samples,
                gyro_samples: self.gyro_samples,
                gps_fixes: self.gps_fixes,
            },
        }
    }

    /// Write the current in-memory log to
    /// `<session_dir>/comparison_<YYYYMMDD_HHMMSS>.json.gz` via a
    /// temp-file-then-rename, so a reader never observes a partially
    /// written file (teacher's `save_json_compressed`). On persistence
    /// failure, one retry is attempted; if that also fails the flush is
    /// dropped and a warning logged — per spec.md 7, losing logs is
    /// preferable to losing real-time tracking, so this never propagates
    /// an error up into the pipeline's hot path.
    pub fn flush(&self, crash_log: Option<&CrashLog>) {
        if let Err(e) = self.try_flush() {
            log::warn!("session log flush failed, retrying once: {e}");
            if let Err(e2) = self.try_flush() {
                log::error!("session log flush dropped after retry: {e2}");
                if let Some(crash_log) = crash_log {
                    crash_log.push_line(format!("recorder flush failed: {e2}"));
                }
            }
        }
    }

    fn try_flush(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.session_dir)?;
        let log = self.session_log();
        let json = serde_json::to_string(&log)?;

        let final_path = self
            .session_dir
            .join(format!("comparison_{}.json.gz", self.started_at));
        let temp_path = self.session_dir.join(format!(
            "comparison_{}.json.gz.tmp",
            self.started_at
        ));

        {
            let file = File::create(&temp_path)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(json.as_bytes())?;
            encoder.finish()?;
        }
        std::fs::rename(&temp_path, &final_path)?;
        Ok(final_path)
    }

    /// Write one incident record to
    /// `<session_dir>/incidents/incident_<ts>_<type>.json`. On failure the
    /// incident stays buffered in `self.incidents` for the next flush
    /// attempt (spec.md 7's incident-save-failure policy).
    pub fn flush_incident(&self, incident: &IncidentRecord) {
        if let Err(e) = self.try_flush_incident(incident) {
            log::warn!(
                "failed to persist incident at t={:.3}: {e} (retained in memory for next flush)",
                incident.trigger_timestamp
            );
        }
    }

    fn try_flush_incident(&self, incident: &IncidentRecord) -> anyhow::Result<()> {
        let dir = self.session_dir.join("incidents");
        std::fs::create_dir_all(&dir)?;
        let type_tag = match incident.event_type {
            crate::types::IncidentType::HardBraking => "hard_braking",
            crate::types::IncidentType::Impact => "impact",
            crate::types::IncidentType::Swerve => "swerve",
        };
        let path = dir.join(format!(
            "incident_{:.0}_{}.json",
            incident.trigger_timestamp * 1000.0,
            type_tag
        ));
        let json = serde_json::to_string_pretty(incident)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccelSample, EsEkfState};
    use tempfile::tempdir;

    fn reading_at(t: f64) -> FusedReading {
        FusedReading {
            timestamp: t,
            accel: Some(AccelSample {
                timestamp: t,
                x: 0.0,
                y: 0.0,
                z: 9.81,
            }),
            gyro: None,
            gps: None,
            ekf_6d: None,
            experimental_15d: Some(EsEkfState::default()),
            specific_power_w_per_kg: 0.0,
        }
    }

    #[test]
    fn flush_writes_a_readable_gzip_json_file() {
        let dir = tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path());
        recorder.push_reading(reading_at(0.0));
        recorder.push_reading(reading_at(0.02));
        recorder.flush(None);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "gz").unwrap_or(false))
            .collect();
        assert_eq!(entries.len(), 1);

        let bytes = std::fs::read(entries[0].path()).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut decompressed = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut decompressed).unwrap();
        let log: SessionLog = serde_json::from_str(&decompressed).unwrap();
        assert_eq!(log.readings.len(), 2);
        assert_eq!(log.metadata.accel_samples, 2);
    }

    #[test]
    fn reading_count_tracks_pushed_readings() {
        let dir = tempdir().unwrap();
        let mut recorder = Recorder::new(dir.path());
        assert_eq!(recorder.reading_count(), 0);
        recorder.push_reading(reading_at(0.0));
        assert_eq!(recorder.reading_count(), 1);
    }
}
