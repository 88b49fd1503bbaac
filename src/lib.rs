//! `telemetry-hub` library crate.
//!
//! Ingests cpu/disk readings from sensor nodes over a lockstep json-lines
//! protocol, keeps a rolling window and health status per sensor, and
//! publishes periodic read-only snapshots for a dashboard. The binaries
//! live in `main.rs` (the hub) and `bin/sensor.rs` (a sensor node).

pub mod api;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod evaluator;
pub mod listener;
pub mod probe;
pub mod snapshot;
pub mod store;

pub use domain::{MetricKind, Reply, ReplyStatus, SensorRequest, Status};
pub use error::IngestError;
pub use evaluator::{AlertPolicy, Evaluator};
pub use listener::Listener;
pub use snapshot::{Snapshot, SnapshotAccessor, SnapshotReader, SensorView};
pub use store::{SensorState, SensorStore};
