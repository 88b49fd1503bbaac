//! ==============================================================================
//! client.rs - the sensor side of the request/reply protocol
//! ==============================================================================
//!
//! a thin lockstep client: write one request line, read exactly one reply
//! line. used by the sensor node binary and by the integration tests.
//!
//! ==============================================================================

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::domain::{Reply, SensorRequest};

pub struct SensorClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl SensorClient {
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("failed to connect to hub at {}", address))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new()),
        })
    }

    pub async fn send(&mut self, request: &SensorRequest) -> Result<Reply> {
        let line = serde_json::to_string(request).context("failed to encode request")?;
        self.send_raw(&line).await
    }

    /// Send an already-encoded line. Lets callers exercise malformed payloads.
    pub async fn send_raw(&mut self, line: &str) -> Result<Reply> {
        self.framed
            .send(line)
            .await
            .context("failed to send request")?;

        let reply = self
            .framed
            .next()
            .await
            .ok_or_else(|| anyhow!("hub closed the connection without replying"))?
            .context("failed to read reply")?;

        serde_json::from_str(&reply).with_context(|| format!("unexpected reply: {}", reply))
    }
}
