//! ==============================================================================
//! evaluator.rs - alert and consistency decisions
//! ==============================================================================
//!
//! purpose:
//!     turns one validated request into one store mutation and the status
//!     that goes back to the sensor. no io, no retries: for any validated
//!     request it either classifies it and applies it, or rejects it as
//!     malformed before the store is touched.
//!
//! decision steps:
//!     1. classify: explicit metric_kind, then field presence, then (only if
//!        allowed) the id prefix. a sensor keeps the kind of its first
//!        reading; a reading of the other kind is malformed
//!     2. append (receipt time, value) to the sensor's window
//!     3. status = ALERT if value > threshold else OK (threshold exclusive)
//!     4. inconsistent readings bump corruption_count
//!     5. total_readings always bumps
//!
//! ==============================================================================

use chrono::{DateTime, Utc};

use crate::domain::{MetricKind, Status, ValidatedRequest};
use crate::error::IngestError;
use crate::store::{Sample, SensorStore};

pub const DEFAULT_ALERT_THRESHOLD: f64 = 80.0;

/// knobs that shape how a reading is judged
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertPolicy {
    pub threshold_percent: f64,
    /// allow the id prefix to break a tie when both usage fields are present
    pub prefix_fallback: bool,
    /// keep inconsistent readings out of the window and status
    pub exclude_inconsistent: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_ALERT_THRESHOLD,
            prefix_fallback: true,
            exclude_inconsistent: false,
        }
    }
}

/// what one accepted request did
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub sensor_id: String,
    pub received_at: DateTime<Utc>,
    pub metric_kind: MetricKind,
    pub value: f64,
    pub data_consistent: bool,
    pub status: Status,
}

pub fn status_for(value: f64, threshold: f64) -> Status {
    if value > threshold {
        Status::Alert
    } else {
        Status::Ok
    }
}

/// Work out which quantity a request carries and its value.
pub fn classify(
    request: &ValidatedRequest,
    prefix_fallback: bool,
) -> Result<(MetricKind, f64), IngestError> {
    let id = request.sensor_id.as_str();
    let value_of = |kind: MetricKind| match kind {
        MetricKind::Cpu => request.cpu_usage_percent,
        MetricKind::Disk => request.disk_usage_percent,
    };

    if let Some(kind) = request.metric_kind {
        return value_of(kind).map(|value| (kind, value)).ok_or_else(|| {
            IngestError::malformed(
                Some(id),
                format!(
                    "metric_kind is {} but {}_usage_percent is missing",
                    kind.as_str(),
                    kind.as_str()
                ),
            )
        });
    }

    match (request.cpu_usage_percent, request.disk_usage_percent) {
        (Some(value), None) => Ok((MetricKind::Cpu, value)),
        (None, Some(value)) => Ok((MetricKind::Disk, value)),
        (Some(_), Some(_)) => {
            let by_prefix = prefix_fallback
                .then(|| MetricKind::from_id_prefix(id))
                .flatten();
            match by_prefix.and_then(|kind| value_of(kind).map(|value| (kind, value))) {
                Some(found) => {
                    tracing::debug!(sensor_id = %id, kind = found.0.as_str(), "classified by id prefix");
                    Ok(found)
                }
                None => Err(IngestError::malformed(
                    Some(id),
                    "ambiguous reading: both cpu_usage_percent and disk_usage_percent present without metric_kind",
                )),
            }
        }
        (None, None) => Err(IngestError::malformed(
            Some(id),
            "one of cpu_usage_percent or disk_usage_percent is required",
        )),
    }
}

/// Applies validated requests to the store.
#[derive(Clone)]
pub struct Evaluator {
    store: SensorStore,
    policy: AlertPolicy,
}

impl Evaluator {
    pub fn new(store: SensorStore, policy: AlertPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &SensorStore {
        &self.store
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Apply one request as a single atomic store mutation.
    pub async fn evaluate(
        &self,
        request: ValidatedRequest,
        now: DateTime<Utc>,
    ) -> Result<Outcome, IngestError> {
        let (kind, value) = classify(&request, self.policy.prefix_fallback)?;
        let consistent = request.data_consistent;
        let AlertPolicy {
            threshold_percent,
            exclude_inconsistent,
            ..
        } = self.policy;

        let (received_at, status) = self
            .store
            .apply(&request.sensor_id, |state, capacity| -> Result<_, IngestError> {
                state.check_kind(kind)?;

                // receipt order wins over a wall clock that stepped backwards
                let at = state.last_update().map_or(now, |last| last.max(now));

                state.count_reading();
                state.set_consistency(consistent);

                if consistent || !exclude_inconsistent {
                    state.push_sample(Sample { timestamp: at, value }, kind, capacity);
                    state.set_status(status_for(value, threshold_percent));
                } else {
                    state.touch(at);
                }

                Ok((at, state.status()))
            })
            .await??;

        if !consistent {
            tracing::warn!(sensor_id = %request.sensor_id, value, "data corruption reported by sensor");
        }
        tracing::debug!(
            sensor_id = %request.sensor_id,
            kind = kind.as_str(),
            value,
            status = ?status,
            sent_at = request.sent_at.as_deref().unwrap_or("-"),
            "reading applied"
        );

        Ok(Outcome {
            sensor_id: request.sensor_id,
            received_at,
            metric_kind: kind,
            value,
            data_consistent: consistent,
            status,
        })
    }
}
