use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::sleep;

use crate::bus::Bus;
use crate::health::SensorHealth;
use crate::types::GpsFix;

/// Polls a GPS oracle command once per `poll_period`, parses its
/// single-shot JSON object, and publishes the fix timestamped at the
/// moment the poll returned (spec.md 4.B: the oracle's own embedded
/// timestamp, if any, is preserved only as `GpsFix::source_timestamp`).
/// Grounded in the teacher's `main.rs::gps_reader_task`.
pub async fn run_gps_source(
    bus: Arc<Bus<GpsFix>>,
    health: Arc<SensorHealth>,
    poll_period: Duration,
) {
    log::info!("gps source starting, poll_period={poll_period:?}");
    let mut fix_count: u64 = 0;

    loop {
        sleep(poll_period).await;

        match Command::new("termux-location").arg("-p").arg("gps").output().await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                match parse_fix(&stdout) {
                    Some(fix) => {
                        health.update();
                        bus.publish(fix);
                        fix_count += 1;
                        if fix_count % 10 == 0 {
                            log::info!(
                                "gps fix #{fix_count}: ({:.5}, {:.5}) speed={:?}",
                                fix.latitude,
                                fix.longitude,
                                fix.speed
                            );
                        }
                    }
                    None => log::debug!("gps poll returned no usable fix"),
                }
            }
            Err(e) => log::warn!("termux-location failed: {e}"),
        }
    }
}

fn parse_fix(stdout: &str) -> Option<GpsFix> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let obj = value.as_object()?;
    let latitude = obj.get("latitude")?.as_f64()?;
    let longitude = obj.get("longitude")?.as_f64()?;

    Some(GpsFix {
        timestamp: now(),
        latitude,
        longitude,
        altitude: obj.get("altitude").and_then(|v| v.as_f64()),
        speed: obj.get("speed").and_then(|v| v.as_f64()),
        bearing: obj.get("bearing").and_then(|v| v.as_f64()),
        accuracy: obj.get("accuracy").and_then(|v| v.as_f64()).unwrap_or(50.0),
        source_timestamp: obj.get("time").and_then(|v| v.as_f64()),
    })
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
