//! ==============================================================================
//! domain.rs - wire schema shared by the hub and sensor nodes
//! ==============================================================================
//!
//! one request line in, one reply line out. requests are parsed into the
//! loose `SensorRequest` first (every field optional) and then validated
//! into a `ValidatedRequest` before anything touches the store.
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// the physical quantity a sensor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Disk,
}

impl MetricKind {
    /// compatibility fallback for senders that only encode the kind in their id
    /// (e.g. "cpu_usage_01", "disk_usage_root")
    pub fn from_id_prefix(sensor_id: &str) -> Option<Self> {
        let id = sensor_id.to_ascii_lowercase();
        if id.starts_with("cpu") {
            Some(Self::Cpu)
        } else if id.starts_with("disk") {
            Some(Self::Disk)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Disk => "disk",
        }
    }
}

/// derived health of a sensor, computed from its latest value only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ALERT")]
    Alert,
}

/// a request exactly as it arrived on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    /// explicit classification; preferred over field presence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_kind: Option<MetricKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_consistent: Option<bool>,
    /// sensor-side clock; informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// a request that passed schema validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub sensor_id: String,
    pub metric_kind: Option<MetricKind>,
    pub cpu_usage_percent: Option<f64>,
    pub disk_usage_percent: Option<f64>,
    pub data_consistent: bool,
    pub sent_at: Option<String>,
}

impl SensorRequest {
    /// Parse and validate one request line.
    pub fn parse(line: &str) -> Result<ValidatedRequest, IngestError> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| IngestError::malformed(None, format!("invalid json: {}", e)))?;

        // keep the id around so the error reply can still name the sensor
        let recovered = value
            .get("sensor_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        let request: SensorRequest = serde_json::from_value(value)
            .map_err(|e| IngestError::malformed(recovered.as_deref(), e.to_string()))?;

        request.validate()
    }

    pub fn validate(self) -> Result<ValidatedRequest, IngestError> {
        let sensor_id = match self.sensor_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(IngestError::malformed(
                    None,
                    "sensor_id is required and must be non-empty",
                ))
            }
        };

        if self.cpu_usage_percent.is_none() && self.disk_usage_percent.is_none() {
            return Err(IngestError::malformed(
                Some(&sensor_id),
                "one of cpu_usage_percent or disk_usage_percent is required",
            ));
        }

        for value in [self.cpu_usage_percent, self.disk_usage_percent].into_iter().flatten() {
            if !value.is_finite() {
                return Err(IngestError::malformed(
                    Some(&sensor_id),
                    format!("reading must be a finite number, got {}", value),
                ));
            }
        }

        Ok(ValidatedRequest {
            sensor_id,
            metric_kind: self.metric_kind,
            cpu_usage_percent: self.cpu_usage_percent,
            disk_usage_percent: self.disk_usage_percent,
            data_consistent: self.data_consistent.unwrap_or(true),
            sent_at: self.timestamp,
        })
    }

    /// Build a request for one reading with an explicit kind.
    pub fn reading(sensor_id: &str, kind: MetricKind, value: f64, data_consistent: bool) -> Self {
        let (cpu_usage_percent, disk_usage_percent) = match kind {
            MetricKind::Cpu => (Some(value), None),
            MetricKind::Disk => (None, Some(value)),
        };
        Self {
            sensor_id: Some(sensor_id.to_string()),
            metric_kind: Some(kind),
            cpu_usage_percent,
            disk_usage_percent,
            data_consistent: Some(data_consistent),
            timestamp: Some(wire_timestamp(Utc::now())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ALERT")]
    Alert,
    /// only when inconsistent readings are excluded and none has been accepted yet
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "ERROR")]
    Error,
}

impl From<Status> for ReplyStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => Self::Ok,
            Status::Alert => Self::Alert,
            Status::Unknown => Self::Unknown,
        }
    }
}

/// the single reply sent for every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub sensor_id: String,
    pub timestamp: String,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn accepted(sensor_id: &str, at: DateTime<Utc>, status: Status) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            timestamp: wire_timestamp(at),
            status: status.into(),
            message: None,
        }
    }

    pub fn rejected(error: &IngestError, at: DateTime<Utc>) -> Self {
        let (sensor_id, message) = match error {
            IngestError::MalformedRequest { sensor_id, .. } => {
                (sensor_id.clone().unwrap_or_default(), error.to_string())
            }
            IngestError::Transport(_) => (String::new(), error.to_string()),
            _ => (String::new(), "internal error".to_string()),
        };
        Self {
            sensor_id,
            timestamp: wire_timestamp(at),
            status: ReplyStatus::Error,
            message: Some(message),
        }
    }

    /// the ingestion worker stopped before this request could be applied
    pub fn unavailable(at: DateTime<Utc>) -> Self {
        Self {
            sensor_id: String::new(),
            timestamp: wire_timestamp(at),
            status: ReplyStatus::Error,
            message: Some("ingestion stopped".to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ReplyStatus::Error
    }
}

/// UTC, second precision: 2024-05-01T12:00:00Z
pub fn wire_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
