//! ==============================================================================
//! snapshot.rs - periodic read-only view for the presentation layer
//! ==============================================================================
//!
//! purpose:
//!     on a fixed cadence, copy every sensor out of the store into an
//!     immutable `Snapshot` and hand it to the registered sinks. the
//!     dashboard (or the json api) only ever sees these copies.
//!
//! consistency:
//!     one snapshot is taken under one read guard, so each sensor's fields
//!     belong to the same mutation cycle. sensors are independent; nothing
//!     stronger is promised across them.
//!
//! relationships:
//!     - reads: store.rs (`snapshot_all`)
//!     - feeds: api.rs (through `WatchSink` / `SnapshotReader`)
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::{MetricKind, Status};
use crate::store::{Sample, SensorState, SensorStore};

/// everything the presentation layer gets for one sensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorView {
    pub sensor_id: String,
    pub metric_kind: Option<MetricKind>,
    pub status: Status,
    /// oldest first, newest last
    pub readings: Vec<Sample>,
    pub latest_value: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    pub total_readings: u64,
    pub corruption_count: u64,
    /// corruption_count / total_readings, in percent
    pub corruption_rate: f64,
    pub data_consistent: bool,
}

impl From<&SensorState> for SensorView {
    fn from(state: &SensorState) -> Self {
        let total = state.total_readings();
        let corrupted = state.corruption_count();
        Self {
            sensor_id: state.sensor_id().to_string(),
            metric_kind: state.metric_kind(),
            status: state.status(),
            readings: state.readings().copied().collect(),
            latest_value: state.latest().map(|s| s.value),
            last_update: state.last_update(),
            total_readings: total,
            corruption_count: corrupted,
            corruption_rate: if total > 0 {
                corrupted as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            data_consistent: state.data_consistent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub ok: usize,
    pub alert: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub sensors: Vec<SensorView>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            sensors: Vec::new(),
        }
    }

    pub async fn capture(store: &SensorStore) -> Self {
        let states = store.snapshot_all().await;
        Self {
            taken_at: Utc::now(),
            sensors: states.iter().map(SensorView::from).collect(),
        }
    }

    pub fn get(&self, sensor_id: &str) -> Option<&SensorView> {
        self.sensors.iter().find(|s| s.sensor_id == sensor_id)
    }

    pub fn of_kind(&self, kind: MetricKind) -> impl Iterator<Item = &SensorView> + '_ {
        self.sensors
            .iter()
            .filter(move |s| s.metric_kind == Some(kind))
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for sensor in &self.sensors {
            match sensor.status {
                Status::Ok => counts.ok += 1,
                Status::Alert => counts.alert += 1,
                Status::Unknown => counts.unknown += 1,
            }
        }
        counts
    }
}

/// something that wants each fresh snapshot
pub trait SnapshotSink: Send + Sync {
    fn publish(&self, snapshot: Arc<Snapshot>);
}

/// publishes through a watch channel; readers always see the latest copy
pub struct WatchSink {
    tx: watch::Sender<Arc<Snapshot>>,
}

#[derive(Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<Snapshot>>,
}

/// Create a connected sink/reader pair, starting from an empty snapshot.
pub fn watch_channel() -> (WatchSink, SnapshotReader) {
    let (tx, rx) = watch::channel(Arc::new(Snapshot::empty()));
    (WatchSink { tx }, SnapshotReader { rx })
}

impl SnapshotSink for WatchSink {
    fn publish(&self, snapshot: Arc<Snapshot>) {
        // no receivers is fine: nothing is watching yet
        self.tx.send_replace(snapshot);
    }
}

impl SnapshotReader {
    pub fn latest(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot. `None` once the sink is gone.
    pub async fn changed(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// logs a one-line summary of each snapshot
pub struct LogSink;

impl SnapshotSink for LogSink {
    fn publish(&self, snapshot: Arc<Snapshot>) {
        let counts = snapshot.status_counts();
        let corrupted = snapshot
            .sensors
            .iter()
            .filter(|s| s.corruption_count > 0)
            .count();
        tracing::debug!(
            sensors = snapshot.sensors.len(),
            cpu = snapshot.of_kind(MetricKind::Cpu).count(),
            disk = snapshot.of_kind(MetricKind::Disk).count(),
            ok = counts.ok,
            alert = counts.alert,
            unknown = counts.unknown,
            corrupted,
            "snapshot"
        );
    }
}

/// Polls the store on a timer and fans each snapshot out to the sinks.
pub struct SnapshotAccessor {
    store: SensorStore,
    sinks: Vec<Box<dyn SnapshotSink>>,
    interval: Duration,
}

impl SnapshotAccessor {
    pub fn new(store: SensorStore, interval: Duration) -> Self {
        Self {
            store,
            sinks: Vec::new(),
            interval,
        }
    }

    pub fn with_sink(mut self, sink: impl SnapshotSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Take one snapshot and publish it.
    pub async fn tick(&self) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot::capture(&self.store).await);
        for sink in &self.sinks {
            sink.publish(snapshot.clone());
        }
        snapshot
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // a slow tick shouldn't turn into a burst of catch-up snapshots
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        tracing::info!("snapshot accessor stopped");
    }
}
