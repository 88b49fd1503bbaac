//! ==============================================================================
//! store.rs - per-sensor rolling window state
//! ==============================================================================
//!
//! purpose:
//!     the single source of truth for every sensor the hub has heard from.
//!     each sensor gets a fixed-capacity window of (timestamp, value) samples,
//!     a derived status, and corruption accounting.
//!
//! concurrency:
//!     the map sits behind one arc<rwlock<>>:
//!     - the ingestion worker takes the write lock once per request
//!     - the snapshot accessor takes the read lock and copies out
//!     because one request is applied under one guard, a reader never sees
//!     total_readings bumped without the matching sample in the window.
//!
//! relationships:
//!     - written by: evaluator.rs (one `apply` per accepted request)
//!     - read by: snapshot.rs (`snapshot_all`)
//!
//! ==============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::domain::{MetricKind, Status};
use crate::error::IngestError;

pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// one point in a sensor's history
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// everything the hub knows about one sensor
///
/// only the store holds these mutably; callers always get clones.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    sensor_id: String,
    readings: VecDeque<Sample>,
    metric_kind: Option<MetricKind>,
    status: Status,
    last_update: Option<DateTime<Utc>>,
    total_readings: u64,
    corruption_count: u64,
    data_consistent: bool,
}

impl SensorState {
    fn new(sensor_id: &str, capacity: usize) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            readings: VecDeque::with_capacity(capacity),
            metric_kind: None,
            status: Status::Unknown,
            last_update: None,
            total_readings: 0,
            corruption_count: 0,
            data_consistent: true,
        }
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    /// oldest first, newest last
    pub fn readings(&self) -> impl ExactSizeIterator<Item = &Sample> + '_ {
        self.readings.iter()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.readings.back()
    }

    pub fn metric_kind(&self) -> Option<MetricKind> {
        self.metric_kind
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn total_readings(&self) -> u64 {
        self.total_readings
    }

    pub fn corruption_count(&self) -> u64 {
        self.corruption_count
    }

    pub fn data_consistent(&self) -> bool {
        self.data_consistent
    }

    /// push into the window, evicting the oldest sample at capacity
    pub(crate) fn push_sample(&mut self, sample: Sample, kind: MetricKind, capacity: usize) {
        while self.readings.len() >= capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(sample);
        self.metric_kind.get_or_insert(kind);
        self.touch(sample.timestamp);
    }

    /// a sensor reports one kind for life; anything else is a malformed reading
    pub(crate) fn check_kind(&self, kind: MetricKind) -> Result<(), IngestError> {
        match self.metric_kind {
            Some(known) if known != kind => Err(IngestError::malformed(
                Some(&self.sensor_id),
                format!("sensor is {}, reading is {}", known.as_str(), kind.as_str()),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.last_update = Some(at);
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// record the latest consistency flag; inconsistent readings also count as corruption
    pub(crate) fn set_consistency(&mut self, consistent: bool) {
        self.data_consistent = consistent;
        if !consistent {
            self.corruption_count += 1;
        }
    }

    pub(crate) fn count_reading(&mut self) {
        self.total_readings += 1;
    }

    fn check_invariants(&self, capacity: usize) -> Result<(), IngestError> {
        let violation = |detail: String| -> Result<(), IngestError> {
            Err(IngestError::InvariantViolation {
                sensor_id: self.sensor_id.clone(),
                detail,
            })
        };

        if self.readings.len() > capacity {
            return violation(format!(
                "window holds {} samples, capacity is {}",
                self.readings.len(),
                capacity
            ));
        }
        if self.corruption_count > self.total_readings {
            return violation(format!(
                "corruption_count {} > total_readings {}",
                self.corruption_count, self.total_readings
            ));
        }
        let len = self.readings.len();
        if len >= 2 && self.readings[len - 1].timestamp < self.readings[len - 2].timestamp {
            return violation("window timestamps went backwards".to_string());
        }
        Ok(())
    }
}

/// concurrency-safe map of sensor id -> state
#[derive(Clone)]
pub struct SensorStore {
    sensors: Arc<RwLock<BTreeMap<String, SensorState>>>,
    capacity: usize,
}

impl Default for SensorStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl SensorStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            sensors: Arc::new(RwLock::new(BTreeMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.sensors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sensors.read().await.is_empty()
    }

    /// Return the sensor's state, creating a default entry on first contact.
    pub async fn get_or_create(&self, sensor_id: &str) -> SensorState {
        let mut sensors = self.sensors.write().await;
        sensors
            .entry(sensor_id.to_string())
            .or_insert_with(|| SensorState::new(sensor_id, self.capacity))
            .clone()
    }

    /// Copy of one sensor, if it is known.
    pub async fn get(&self, sensor_id: &str) -> Option<SensorState> {
        self.sensors.read().await.get(sensor_id).cloned()
    }

    /// Run one mutation against a sensor under a single write guard.
    ///
    /// The entry is created if needed, and invariants are checked before the
    /// guard is released. A violation means the store is broken and is
    /// returned as [`IngestError::InvariantViolation`].
    pub async fn apply<R>(
        &self,
        sensor_id: &str,
        mutate: impl FnOnce(&mut SensorState, usize) -> R,
    ) -> Result<R, IngestError> {
        let mut sensors = self.sensors.write().await;
        let state = sensors
            .entry(sensor_id.to_string())
            .or_insert_with(|| SensorState::new(sensor_id, self.capacity));
        let out = mutate(state, self.capacity);
        state.check_invariants(self.capacity)?;
        Ok(out)
    }

    /// Push one sample. A reading whose kind differs from the sensor's leaves
    /// the window untouched and comes back as a malformed request.
    pub async fn append_reading(
        &self,
        sensor_id: &str,
        timestamp: DateTime<Utc>,
        value: f64,
        kind: MetricKind,
    ) -> Result<(), IngestError> {
        self.apply(sensor_id, |state, capacity| -> Result<(), IngestError> {
            state.check_kind(kind)?;
            state.push_sample(Sample { timestamp, value }, kind, capacity);
            Ok(())
        })
        .await?
    }

    pub async fn record_status(&self, sensor_id: &str, status: Status) -> Result<(), IngestError> {
        self.apply(sensor_id, |state, _| state.set_status(status)).await
    }

    /// Count one accepted reading and record its consistency flag.
    pub async fn record_consistency(
        &self,
        sensor_id: &str,
        consistent: bool,
    ) -> Result<(), IngestError> {
        self.apply(sensor_id, |state, _| {
            state.count_reading();
            state.set_consistency(consistent);
        })
        .await
    }

    /// Copy out every sensor, ordered by id.
    pub async fn snapshot_all(&self) -> Vec<SensorState> {
        self.sensors.read().await.values().cloned().collect()
    }
}
