//! `telemetry-sensor` -- host utilisation sensor node.
//!
//! Samples this machine's cpu load and root disk usage, checks each sample
//! for sanity, and reports it to the hub one request at a time, waiting for
//! the reply before sending the next.
//!
//! # Environment variables
//!
//! | Variable           | Required | Default          | Description                        |
//! |--------------------|----------|------------------|------------------------------------|
//! | `HUB_ADDRESS`      | no       | `127.0.0.1:5555` | Hub ingestion endpoint             |
//! | `CPU_INTERVAL_MS`  | no       | `1000`           | Milliseconds between cpu samples   |
//! | `DISK_INTERVAL_MS` | no       | `5000`           | Milliseconds between disk samples  |
//! | `DISK_PATH`        | no       | `/`              | Mount point whose usage is sampled |

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telemetry_hub::client::SensorClient;
use telemetry_hub::probe::{self, HostProbe};
use telemetry_hub::{MetricKind, ReplyStatus, SensorRequest};

const CPU_SENSOR_ID: &str = "cpu_usage_01";
const DISK_SENSOR_ID: &str = "disk_usage_root";

/// Reconnection delay after a transport failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Log running stats every this many samples.
const STATS_EVERY: u64 = 50;

#[derive(Default)]
struct Stats {
    samples: u64,
    corrupted: u64,
    delivered: u64,
    failed: u64,
}

impl Stats {
    fn corruption_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.corrupted as f64 / self.samples as f64 * 100.0
        }
    }

    fn log(&self, message: &'static str) {
        tracing::info!(
            samples = self.samples,
            corrupted = self.corrupted,
            corruption_rate = %format!("{:.1}%", self.corruption_rate()),
            delivered = self.delivered,
            failed = self.failed,
            "{}",
            message
        );
    }
}

fn env_millis(name: &str, default: u64) -> Duration {
    let millis = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(default);
    Duration::from_millis(millis)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemetry_sensor=info,telemetry_hub=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let hub = std::env::var("HUB_ADDRESS").unwrap_or_else(|_| "127.0.0.1:5555".to_string());
    let cpu_every = env_millis("CPU_INTERVAL_MS", 1_000)
        .max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    let disk_every = env_millis("DISK_INTERVAL_MS", 5_000);
    let disk_path = std::env::var("DISK_PATH").unwrap_or_else(|_| "/".to_string());

    tracing::info!(
        hub = %hub,
        cpu_ms = cpu_every.as_millis() as u64,
        disk_ms = disk_every.as_millis() as u64,
        disk_path = %disk_path,
        "Starting sensor node",
    );

    let mut probe = HostProbe::new(disk_path);

    // first cpu sample needs a full interval of deltas behind it
    let mut cpu_ticker = interval_at(Instant::now() + cpu_every, cpu_every);
    let mut disk_ticker = interval_at(Instant::now(), disk_every);
    cpu_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    disk_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stats = Stats::default();
    let mut client: Option<SensorClient> = None;
    let mut reconnect_at = Instant::now();

    loop {
        let (sensor_id, kind, value) = tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("SIGINT received, exiting");
                break;
            }
            _ = cpu_ticker.tick() => (CPU_SENSOR_ID, MetricKind::Cpu, probe.cpu_usage_percent()),
            _ = disk_ticker.tick() => match probe.disk_usage_percent() {
                Some(value) => (DISK_SENSOR_ID, MetricKind::Disk, value),
                None => {
                    tracing::warn!(path = %probe.disk_path().display(), "no disk mounted at path");
                    continue;
                }
            },
        };

        let consistent = probe::is_consistent(sensor_id, kind, value);
        stats.samples += 1;
        if !consistent {
            stats.corrupted += 1;
            tracing::error!(sensor_id, value, "data corruption detected in sample");
        }

        if client.is_none() && Instant::now() < reconnect_at {
            stats.failed += 1;
        } else {
            let request = SensorRequest::reading(sensor_id, kind, value, consistent);
            match deliver(&mut client, &hub, &request).await {
                Ok(status) => {
                    stats.delivered += 1;
                    tracing::debug!(sensor_id, value, ?status, "reading delivered");
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(sensor_id, error = %e, "send/recv with hub failed");
                    client = None;
                    reconnect_at = Instant::now() + RECONNECT_DELAY;
                }
            }
        }

        if stats.samples % STATS_EVERY == 0 {
            stats.log("sensor stats");
        }
    }

    stats.log("final sensor stats");
    Ok(())
}

/// Send one reading, connecting first if needed.
async fn deliver(
    client: &mut Option<SensorClient>,
    hub: &str,
    request: &SensorRequest,
) -> Result<ReplyStatus> {
    if client.is_none() {
        *client = Some(SensorClient::connect(hub).await?);
        tracing::info!(hub, "connected to hub");
    }
    let connection = client.as_mut().ok_or_else(|| anyhow!("not connected"))?;

    let reply = connection.send(request).await?;
    match reply.status {
        ReplyStatus::Error => tracing::warn!(
            message = reply.message.as_deref().unwrap_or(""),
            "hub rejected reading"
        ),
        ReplyStatus::Alert => tracing::warn!(sensor_id = %reply.sensor_id, "hub reports ALERT"),
        _ => {}
    }
    Ok(reply.status)
}
