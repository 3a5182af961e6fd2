use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::bus::Bus;
use crate::health::SensorHealth;
use crate::types::{AccelSample, GyroSample};

/// Maximum bytes a single accumulated JSON buffer may grow to before it is
/// discarded as malformed, matching the teacher's `imu_reader_task` safety
/// valve exactly.
const MAX_JSON_BUFFER_BYTES: usize = 4096;

/// One run of the IMU subprocess: spawns `termux-sensor`, accumulates its
/// stdout into complete JSON objects via brace-depth counting (grounded
/// verbatim in `main.rs::imu_reader_task`), and publishes parsed samples
/// onto the accel/gyro buses. Returns when the subprocess's stdout closes
/// (crash, kill, or clean exit) so the caller's supervisor loop can decide
/// whether to restart. `gyro_bus` is `None` when gyro integration is
/// disabled (spec.md 4.A: both streams share one subprocess, so `None`
/// here only suppresses publishing, not the parse itself).
pub async fn run_imu_daemon(
    accel_bus: Arc<Bus<AccelSample>>,
    gyro_bus: Option<Arc<Bus<GyroSample>>>,
    accel_health: Arc<SensorHealth>,
    gyro_health: Arc<SensorHealth>,
    accel_period_ms: u64,
) -> anyhow::Result<()> {
    let sensor_list = if gyro_bus.is_some() {
        "Accelerometer,Gyroscope"
    } else {
        "Accelerometer"
    };
    log::info!("imu daemon starting, sensors={sensor_list}");

    let _ = Command::new("termux-sensor").arg("-c").output().await;

    let mut child = Command::new("termux-sensor")
        .arg("-s")
        .arg(sensor_list)
        .arg("-d")
        .arg(accel_period_ms.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("termux-sensor: no stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("termux-sensor: no stderr"))?;

    tokio::spawn(async move {
        let mut lines = AsyncBufReadExt::lines(BufReader::new(stderr));
        while let Ok(Some(line)) = lines.next_line().await {
            log::warn!("termux-sensor stderr: {line}");
        }
    });

    let mut lines = AsyncBufReadExt::lines(BufReader::new(stdout));
    let mut json_buffer = String::new();
    let mut brace_depth: i32 = 0;
    let mut malformed_counter: u64 = 0;
    let mut accel_count: u64 = 0;
    let mut gyro_count: u64 = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        for ch in trimmed.chars() {
            match ch {
                '{' => brace_depth += 1,
                '}' => brace_depth -= 1,
                _ => {}
            }
        }

        if !json_buffer.is_empty() {
            json_buffer.push(' ');
        }
        json_buffer.push_str(trimmed);

        if json_buffer.len() > MAX_JSON_BUFFER_BYTES {
            malformed_counter += 1;
            log::warn!(
                "imu json buffer exceeded {MAX_JSON_BUFFER_BYTES} bytes, discarding (count={malformed_counter})"
            );
            json_buffer.clear();
            brace_depth = 0;
            continue;
        }

        if brace_depth == 0 && !json_buffer.is_empty() && json_buffer.contains('{') {
            if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(&json_buffer) {
                for (sensor_key, sensor_data) in obj.iter() {
                    if sensor_key.contains("Accelerometer") {
                        if let Some(sample) = parse_vector3(sensor_data) {
                            accel_health.update();
                            accel_bus.publish(AccelSample {
                                timestamp: now(),
                                x: sample[0],
                                y: sample[1],
                                z: sample[2],
                            });
                            accel_count += 1;
                        }
                    } else if sensor_key.contains("Gyroscope") {
                        if let Some(sample) = parse_vector3(sensor_data) {
                            gyro_health.update();
                            if let Some(bus) = gyro_bus.as_ref() {
                                bus.publish(GyroSample {
                                    timestamp: now(),
                                    wx: sample[0],
                                    wy: sample[1],
                                    wz: sample[2],
                                });
                            }
                            gyro_count += 1;
                        }
                    }
                }
            } else {
                malformed_counter += 1;
            }
            json_buffer.clear();
        }
    }

    log::info!("imu daemon stream ended: accel={accel_count} gyro={gyro_count} malformed={malformed_counter}");
    anyhow::bail!("termux-sensor stream closed")
}

fn parse_vector3(sensor_data: &serde_json::Value) -> Option<[f64; 3]> {
    let values = sensor_data.get("values")?.as_array()?;
    if values.len() < 3 {
        return None;
    }
    Some([
        values[0].as_f64().unwrap_or(0.0),
        values[1].as_f64().unwrap_or(0.0),
        values[2].as_f64().unwrap_or(0.0),
    ])
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vector3_extracts_xyz_from_values_array() {
        let json: serde_json::Value = serde_json::json!({
            "values": [1.0, 2.0, 3.0]
        });
        assert_eq!(parse_vector3(&json), Some([1.0, 2.0, 3.0]));
    }

    #[test]
    fn parse_vector3_rejects_short_arrays() {
        let json: serde_json::Value = serde_json::json!({ "values": [1.0, 2.0] });
        assert_eq!(parse_vector3(&json), None);
    }
}
