//! ==============================================================================
//! listener.rs - request/reply ingestion endpoint
//! ==============================================================================
//!
//! purpose:
//!     terminates the tcp endpoint sensors talk to. every connection speaks
//!     json lines in strict lockstep: one request line, one reply line, then
//!     the next request. a reply is sent for every request, including bad ones.
//!
//! architecture:
//!
//! ```text
//!     ┌──────────────┐   ┌──────────────┐
//!     │ connection a │   │ connection b │   parse + validate, one in flight each
//!     └──────┬───────┘   └──────┬───────┘
//!            │ job + oneshot    │
//!            └────────┬─────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │ bounded queue   │ <- backpressure: full queue = peers stop being read
//!            └────────┬────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │ ingestion worker│ <- the only writer to the store
//!            └─────────────────┘
//! ```
//!
//! failure handling:
//!     - malformed request: ERROR reply, connection stays open
//!     - receive/send failure or idle timeout: that connection closes,
//!       the endpoint keeps serving
//!     - bind failure: returned from `Listener::bind`, startup aborts
//!     - store invariant violation: the worker stops and cancels everything
//!
//! ==============================================================================

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::IngestConfig;
use crate::domain::{Reply, SensorRequest, ValidatedRequest};
use crate::error::IngestError;
use crate::evaluator::Evaluator;

/// pause after a failed accept so fd exhaustion doesn't spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// one validated request waiting for the worker, plus where its reply goes
struct Job {
    request: ValidatedRequest,
    reply: oneshot::Sender<Reply>,
}

pub struct Listener {
    listener: TcpListener,
    evaluator: Evaluator,
    config: IngestConfig,
}

impl Listener {
    /// Bind the endpoint. Failure here is fatal for the service.
    pub async fn bind(config: IngestConfig, evaluator: Evaluator) -> Result<Self, IngestError> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|source| IngestError::Bind {
                address: config.bind_address.clone(),
                source,
            })?;

        Ok(Self {
            listener,
            evaluator,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires.
    ///
    /// On shutdown the endpoint closes first, in-flight exchanges finish,
    /// queued requests drain, and then this returns. Only a store invariant
    /// violation makes it return an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), IngestError> {
        let Self {
            listener,
            evaluator,
            config,
        } = self;

        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_depth);
        let worker = tokio::spawn(run_worker(evaluator, jobs_rx, shutdown.clone()));
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "sensor connected");
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            jobs_tx.clone(),
                            config.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        tracing::info!("ingestion endpoint closed, finishing in-flight requests");

        drop(jobs_tx);
        connections.close();
        connections.wait().await;

        match worker.await {
            Ok(result) => result,
            Err(e) => Err(IngestError::InvariantViolation {
                sensor_id: "-".to_string(),
                detail: format!("ingestion worker panicked: {}", e),
            }),
        }
    }
}

/// The single writer: applies queued requests one at a time.
async fn run_worker(
    evaluator: Evaluator,
    mut jobs: mpsc::Receiver<Job>,
    shutdown: CancellationToken,
) -> Result<(), IngestError> {
    let mut applied: u64 = 0;

    while let Some(Job { request, reply }) = jobs.recv().await {
        let sensor_id = request.sensor_id.clone();

        let response = match evaluator.evaluate(request, Utc::now()).await {
            Ok(outcome) => {
                applied += 1;
                Reply::accepted(&outcome.sensor_id, outcome.received_at, outcome.status)
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(%sensor_id, error = %err, "stopping ingestion");
                let _ = reply.send(Reply::rejected(&err, Utc::now()));
                shutdown.cancel();
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(%sensor_id, error = %err, "request rejected");
                Reply::rejected(&err, Utc::now())
            }
        };

        if reply.send(response).is_err() {
            tracing::debug!(%sensor_id, "peer went away before its reply");
        }
    }

    tracing::info!(applied, "ingestion worker drained");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    jobs: mpsc::Sender<Job>,
    config: IngestConfig,
    shutdown: CancellationToken,
) {
    let limit = config.request_timeout();
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(config.max_frame_bytes));

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = bounded(limit, framed.next()) => frame,
        };

        let (reply, keep_open) = match frame {
            None => {
                tracing::warn!(%peer, "no request within timeout, closing");
                break;
            }
            Some(None) => {
                tracing::info!(%peer, "sensor disconnected");
                break;
            }
            Some(Some(Ok(line))) => match exchange(&line, peer, &jobs).await {
                Some(reply) => (reply, true),
                None => (Reply::unavailable(Utc::now()), false),
            },
            Some(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let err = IngestError::malformed(
                    None,
                    format!("request exceeds {} bytes", config.max_frame_bytes),
                );
                tracing::warn!(%peer, error = %err, "closing connection");
                (Reply::rejected(&err, Utc::now()), false)
            }
            Some(Some(Err(e))) => {
                tracing::warn!(%peer, error = %IngestError::from(e), "receive failed");
                break;
            }
        };

        if let Err(e) = send_reply(&mut framed, &reply, limit).await {
            tracing::warn!(%peer, error = %e, "reply not delivered");
            break;
        }
        if !keep_open {
            break;
        }
    }
}

/// Validate one request line and wait for the worker's verdict.
///
/// `None` means the worker is gone and the request was not applied.
async fn exchange(line: &str, peer: SocketAddr, jobs: &mpsc::Sender<Job>) -> Option<Reply> {
    tracing::trace!(%peer, raw = %line, "request received");

    let request = match SensorRequest::parse(line) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%peer, error = %err, "request rejected");
            return Some(Reply::rejected(&err, Utc::now()));
        }
    };

    let (tx, rx) = oneshot::channel();
    jobs.send(Job { request, reply: tx }).await.ok()?;
    rx.await.ok()
}

async fn send_reply(
    framed: &mut Framed<TcpStream, LinesCodec>,
    reply: &Reply,
    limit: Option<Duration>,
) -> Result<(), IngestError> {
    let line = serde_json::to_string(reply).map_err(|e| {
        IngestError::Transport(LinesCodecError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e,
        )))
    })?;

    match bounded(limit, framed.send(line)).await {
        Some(sent) => sent.map_err(IngestError::from),
        None => Err(IngestError::Transport(LinesCodecError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "reply send timed out",
        )))),
    }
}

/// `None` when the limit elapsed first
async fn bounded<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
