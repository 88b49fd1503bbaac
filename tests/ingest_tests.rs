//! Integration tests for the ingestion endpoint.
//!
//! Each test binds a real listener on 127.0.0.1:0 and talks to it through
//! [`SensorClient`] over tcp, exactly as a sensor node would.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use telemetry_hub::client::SensorClient;
use telemetry_hub::config::IngestConfig;
use telemetry_hub::{
    AlertPolicy, Evaluator, IngestError, Listener, MetricKind, ReplyStatus, SensorRequest,
    SensorStore, Snapshot, Status,
};

struct Hub {
    store: SensorStore,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), IngestError>>,
}

impl Hub {
    async fn client(&self) -> SensorClient {
        SensorClient::connect(&self.addr.to_string())
            .await
            .expect("hub should accept connections")
    }

    async fn stop(self) -> Result<(), IngestError> {
        self.shutdown.cancel();
        self.task.await.expect("listener task should not panic")
    }
}

fn ingest_config() -> IngestConfig {
    IngestConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ..IngestConfig::default()
    }
}

async fn start_hub_with(config: IngestConfig, policy: AlertPolicy) -> Hub {
    let store = SensorStore::default();
    let evaluator = Evaluator::new(store.clone(), policy);
    let listener = Listener::bind(config, evaluator).await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(listener.run(shutdown.clone()));
    Hub {
        store,
        addr,
        shutdown,
        task,
    }
}

async fn start_hub() -> Hub {
    start_hub_with(ingest_config(), AlertPolicy::default()).await
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A cpu reading above the threshold raises ALERT in the reply and the store.
#[tokio::test]
async fn cpu_reading_above_threshold_alerts() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":95}"#)
        .await
        .unwrap();

    assert_eq!(reply.sensor_id, "cpu-1");
    assert_eq!(reply.status, ReplyStatus::Alert);
    assert!(
        chrono::NaiveDateTime::parse_from_str(&reply.timestamp, "%Y-%m-%dT%H:%M:%SZ").is_ok(),
        "timestamp {} should be second-precision UTC",
        reply.timestamp
    );

    let state = hub.store.get("cpu-1").await.unwrap();
    assert_eq!(state.status(), Status::Alert);
    assert_eq!(state.metric_kind(), Some(MetricKind::Cpu));

    hub.stop().await.unwrap();
}

/// An inconsistent disk reading is counted as corruption but still accepted.
#[tokio::test]
async fn inconsistent_disk_reading_is_counted() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    let reply = client
        .send_raw(r#"{"sensor_id":"disk-1","disk_usage_percent":50,"data_consistent":false}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    let state = hub.store.get("disk-1").await.unwrap();
    assert_eq!(state.corruption_count(), 1);
    assert_eq!(state.total_readings(), 1);
    assert_eq!(state.status(), Status::Ok);
    assert!(!state.data_consistent());

    hub.stop().await.unwrap();
}

/// A request without sensor_id gets an ERROR reply and the hub keeps serving.
#[tokio::test]
async fn missing_sensor_id_is_answered_and_service_continues() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    let reply = client.send_raw(r#"{"cpu_usage_percent":12}"#).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    assert_eq!(reply.sensor_id, "");
    assert!(reply.message.unwrap().contains("sensor_id"));

    // same connection
    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":12}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    // a different sensor on a fresh connection
    let mut other = hub.client().await;
    let reply = other
        .send(&SensorRequest::reading("disk-9", MetricKind::Disk, 81.0, true))
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Alert);

    assert!(hub.store.get("cpu-1").await.is_some());
    assert_eq!(hub.store.len().await, 2, "rejected request created no sensor");

    hub.stop().await.unwrap();
}

/// 150 readings leave exactly the last 100, in arrival order.
#[tokio::test]
async fn window_keeps_last_hundred_in_order() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    for i in 0..150 {
        let reply = client
            .send(&SensorRequest::reading("cpu-2", MetricKind::Cpu, i as f64 * 0.5, true))
            .await
            .unwrap();
        assert!(!reply.is_error());
    }

    let snapshot = Snapshot::capture(&hub.store).await;
    let view = snapshot.get("cpu-2").unwrap();
    let values: Vec<f64> = view.readings.iter().map(|s| s.value).collect();
    let expected: Vec<f64> = (50..150).map(|i| i as f64 * 0.5).collect();

    assert_eq!(values, expected);
    assert_eq!(view.total_readings, 150);
    assert!(view
        .readings
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));

    hub.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exactly_threshold_is_ok() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":80.0}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":80.01}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Alert);

    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":3}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok, "status follows the latest value only");

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn counters_match_what_was_sent() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    let mut corrupted = 0;
    for i in 0..120u32 {
        let consistent = i % 7 != 0;
        if !consistent {
            corrupted += 1;
        }
        client
            .send(&SensorRequest::reading("disk-3", MetricKind::Disk, 42.0, consistent))
            .await
            .unwrap();
    }

    let state = hub.store.get("disk-3").await.unwrap();
    assert_eq!(state.total_readings(), 120);
    assert_eq!(state.corruption_count(), corrupted);
    assert_eq!(state.readings().len(), 100);

    hub.stop().await.unwrap();
}

/// Snapshots taken during ingestion never see a half-applied request.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshots_during_ingestion_are_never_torn() {
    let hub = start_hub().await;
    let store = hub.store.clone();
    let done = CancellationToken::new();

    let reader_done = done.clone();
    let reader = tokio::spawn(async move {
        let mut observed = 0usize;
        while !reader_done.is_cancelled() {
            let snapshot = Snapshot::capture(&store).await;
            if let Some(view) = snapshot.get("cpu-4") {
                let expected = view.total_readings.min(100) as usize;
                assert_eq!(view.readings.len(), expected, "torn snapshot: {:?}", view);
                assert_eq!(
                    view.latest_value,
                    view.readings.last().map(|s| s.value),
                    "latest value out of step with window"
                );
                observed += 1;
            }
            tokio::task::yield_now().await;
        }
        observed
    });

    let mut client = hub.client().await;
    for i in 0..300 {
        client
            .send(&SensorRequest::reading("cpu-4", MetricKind::Cpu, (i % 100) as f64, true))
            .await
            .unwrap();
    }
    done.cancel();

    let observed = reader.await.unwrap();
    assert!(observed > 0, "reader should have seen the sensor at least once");

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn interleaved_connections_share_one_store() {
    let hub = start_hub().await;
    let mut a = hub.client().await;
    let mut b = hub.client().await;

    for i in 0..10 {
        a.send(&SensorRequest::reading("shared", MetricKind::Cpu, i as f64, true))
            .await
            .unwrap();
        b.send(&SensorRequest::reading("shared", MetricKind::Cpu, 100.0 + i as f64, true))
            .await
            .unwrap();
    }

    let state = hub.store.get("shared").await.unwrap();
    assert_eq!(state.total_readings(), 20);
    assert_eq!(state.latest().map(|s| s.value), Some(109.0));
    assert_eq!(state.status(), Status::Alert);

    hub.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Malformed input and transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn garbage_gets_an_error_reply() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    for line in [
        "not json at all",
        "[]",
        r#"{"sensor_id":"cpu-1"}"#,
        r#"{"sensor_id":"cpu-1","cpu_usage_percent":"ninety"}"#,
        r#"{"sensor_id":"node-1","cpu_usage_percent":1,"disk_usage_percent":2}"#,
    ] {
        let reply = client.send_raw(line).await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Error, "line {} should be rejected", line);
        assert!(reply.message.is_some());
    }

    // the id survives a type error so the sensor can tell which reading failed
    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":"ninety"}"#)
        .await
        .unwrap();
    assert_eq!(reply.sensor_id, "cpu-1");

    assert!(hub.store.is_empty().await, "nothing malformed reached the store");

    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":1}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    hub.stop().await.unwrap();
}

/// A sensor keeps the kind of its first reading; a reading of the other kind
/// is refused and never lands in the existing series.
#[tokio::test]
async fn reading_of_another_kind_is_refused() {
    let hub = start_hub().await;
    let mut client = hub.client().await;

    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","metric_kind":"cpu","cpu_usage_percent":10}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","metric_kind":"disk","disk_usage_percent":95}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    assert_eq!(reply.sensor_id, "cpu-1");

    let state = hub.store.get("cpu-1").await.unwrap();
    let values: Vec<f64> = state.readings().map(|s| s.value).collect();
    assert_eq!(values, vec![10.0]);
    assert_eq!(state.status(), Status::Ok);
    assert_eq!(state.metric_kind(), Some(MetricKind::Cpu));
    assert_eq!(state.total_readings(), 1);

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_frame_is_rejected_and_closed() {
    let hub = start_hub_with(
        IngestConfig {
            max_frame_bytes: 128,
            ..ingest_config()
        },
        AlertPolicy::default(),
    )
    .await;
    let mut client = hub.client().await;

    let padding = "x".repeat(512);
    let line = format!(r#"{{"sensor_id":"{}","cpu_usage_percent":1}}"#, padding);
    let reply = client.send_raw(&line).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);

    assert!(client.send_raw(r#"{"sensor_id":"a","cpu_usage_percent":1}"#).await.is_err());

    // the endpoint itself is still fine
    let mut fresh = hub.client().await;
    let reply = fresh
        .send_raw(r#"{"sensor_id":"a","cpu_usage_percent":1}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn idle_peer_is_dropped_after_timeout() {
    let hub = start_hub_with(
        IngestConfig {
            request_timeout_ms: 100,
            ..ingest_config()
        },
        AlertPolicy::default(),
    )
    .await;

    let mut stalled = tokio::net::TcpStream::connect(hub.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stalled.read(&mut buf))
        .await
        .expect("hub should close the idle connection")
        .unwrap();
    assert_eq!(read, 0);

    let mut client = hub.client().await;
    let reply = client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":1}"#)
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn excluded_policy_keeps_corrupt_values_out() {
    let hub = start_hub_with(
        ingest_config(),
        AlertPolicy {
            exclude_inconsistent: true,
            ..AlertPolicy::default()
        },
    )
    .await;
    let mut client = hub.client().await;

    let reply = client
        .send(&SensorRequest::reading("cpu-5", MetricKind::Cpu, 150.0, false))
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Unknown);

    let state = hub.store.get("cpu-5").await.unwrap();
    assert_eq!(state.readings().len(), 0);
    assert_eq!(state.corruption_count(), 1);

    hub.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bind_conflict_is_a_bind_error() {
    let hub = start_hub().await;
    let config = IngestConfig {
        bind_address: hub.addr.to_string(),
        ..IngestConfig::default()
    };

    let err = Listener::bind(config, Evaluator::new(SensorStore::default(), AlertPolicy::default()))
        .await
        .err()
        .expect("second bind on the same port should fail");
    assert!(matches!(err, IngestError::Bind { .. }));
    assert!(err.is_fatal());

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_endpoint_and_returns_cleanly() {
    let hub = start_hub().await;
    let addr = hub.addr;

    let mut client = hub.client().await;
    client
        .send_raw(r#"{"sensor_id":"cpu-1","cpu_usage_percent":1}"#)
        .await
        .unwrap();

    let store = hub.store.clone();
    hub.stop().await.expect("clean shutdown");

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    assert_eq!(store.get("cpu-1").await.unwrap().total_readings(), 1);
}
