//! ==============================================================================
//! error.rs - failure taxonomy for the ingestion path
//! ==============================================================================
//!
//! every failure the hub can hit while serving sensors falls into one of
//! these buckets. the listener decides what to do with each:
//!     - MalformedRequest:   reply with ERROR, keep serving
//!     - Transport:          log, drop that connection, keep serving
//!     - Bind:               fatal, startup aborts
//!     - InvariantViolation: fatal, the store is in a state it should never reach
//!     - Config:             fatal, `HubConfig::validate` rejected the settings
//!
//! ==============================================================================

use tokio_util::codec::LinesCodecError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed request: {reason}")]
    MalformedRequest {
        /// whatever identifier could be recovered from the payload
        sensor_id: Option<String>,
        reason: String,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] LinesCodecError),

    #[error("store invariant violated for sensor {sensor_id}: {detail}")]
    InvariantViolation { sensor_id: String, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IngestError {
    pub fn malformed(sensor_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self::MalformedRequest {
            sensor_id: sensor_id.map(str::to_owned),
            reason: reason.into(),
        }
    }

    /// Fatal errors stop the service; everything else is contained to one exchange.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. } | Self::InvariantViolation { .. } | Self::Config(_)
        )
    }
}
