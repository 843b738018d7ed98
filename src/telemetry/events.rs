use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Events emitted by the limiter, dispatcher and batch consumer.
///
/// Events are delivered best-effort to a [`TelemetrySink`](super::TelemetrySink); a slow or
/// failing sink never changes the outcome of the operation that emitted the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourierEvent {
    /// Admission decisions
    Limiter(LimiterEvent),
    /// Delivery attempts and backend rotation
    Failover(FailoverEvent),
    /// Batch consumer lifecycle
    Batch(BatchEvent),
}

/// Events emitted by the sliding-window limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// An event was admitted and recorded in the window.
    Admitted {
        /// Bucket that admitted the event
        key: String,
        /// Slots left in the window after this event
        remaining: u32,
    },
    /// An event was denied; nothing was recorded.
    Denied {
        /// Bucket that denied the event
        key: String,
        /// Time until the oldest event in the window expires
        wait: Duration,
    },
    /// The counter store could not be evaluated.
    StoreUnavailable {
        /// Bucket that was being evaluated
        key: String,
    },
}

/// Events emitted by the failover dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverEvent {
    /// The active backend delivered the notification.
    Delivered {
        /// Index of the backend in the dispatcher's list
        backend: usize,
        /// Time taken by the attempt
        duration: Duration,
    },
    /// The active backend failed or timed out.
    AttemptFailed {
        /// Index of the backend in the dispatcher's list
        backend: usize,
        /// Failure streak on this backend including this attempt
        consecutive_failures: usize,
        /// Whether the attempt hit the per-attempt deadline
        timed_out: bool,
    },
    /// The failure streak reached the threshold and the next backend became active.
    Demoted {
        /// Index of the demoted backend
        from: usize,
        /// Index of the newly active backend
        to: usize,
    },
    /// The limiter failed and the dispatcher is configured to fail open.
    LimiterBypassed,
}

/// Events emitted by the batch consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    /// A record payload failed to decode. The record stays in the batch.
    DecodeFailed {
        /// Partition of the record
        partition: i32,
        /// Offset of the record
        offset: i64,
    },
    /// A batch was handed to the handler.
    Dispatched {
        /// Raw records in the batch
        records: usize,
        /// Payloads that decoded successfully
        decoded: usize,
        /// Time spent collecting the batch
        collected_in: Duration,
    },
    /// The handler returned an error. The batch is still acknowledged.
    HandlerFailed {
        /// Raw records in the failed batch
        records: usize,
    },
    /// Every record in a batch was marked consumed.
    Acknowledged {
        /// Raw records acknowledged
        records: usize,
    },
}

impl fmt::Display for CourierEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CourierEvent::Limiter(event) => write!(f, "Limiter::{}", event),
            CourierEvent::Failover(event) => write!(f, "Failover::{}", event),
            CourierEvent::Batch(event) => write!(f, "Batch::{}", event),
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Admitted { key, remaining } => {
                write!(f, "Admitted(key={}, remaining={})", key, remaining)
            }
            LimiterEvent::Denied { key, wait } => write!(f, "Denied(key={}, wait={:?})", key, wait),
            LimiterEvent::StoreUnavailable { key } => write!(f, "StoreUnavailable(key={})", key),
        }
    }
}

impl fmt::Display for FailoverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverEvent::Delivered { backend, duration } => {
                write!(f, "Delivered(#{}, duration={:?})", backend, duration)
            }
            FailoverEvent::AttemptFailed { backend, consecutive_failures, timed_out } => write!(
                f,
                "AttemptFailed(#{}, streak={}, timed_out={})",
                backend, consecutive_failures, timed_out
            ),
            FailoverEvent::Demoted { from, to } => write!(f, "Demoted(#{} -> #{})", from, to),
            FailoverEvent::LimiterBypassed => write!(f, "LimiterBypassed"),
        }
    }
}

impl fmt::Display for BatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchEvent::DecodeFailed { partition, offset } => {
                write!(f, "DecodeFailed({}@{})", partition, offset)
            }
            BatchEvent::Dispatched { records, decoded, collected_in } => write!(
                f,
                "Dispatched(records={}, decoded={}, collected_in={:?})",
                records, decoded, collected_in
            ),
            BatchEvent::HandlerFailed { records } => write!(f, "HandlerFailed(records={})", records),
            BatchEvent::Acknowledged { records } => write!(f, "Acknowledged(records={})", records),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a CourierEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &CourierEvent) -> serde_json::Value {
    match event {
        CourierEvent::Limiter(l) => match l {
            LimiterEvent::Admitted { key, remaining } => {
                json!({ "kind": "limiter_admitted", "key": key, "remaining": *remaining })
            }
            LimiterEvent::Denied { key, wait } => json!({
                "kind": "limiter_denied",
                "key": key,
                "wait_ms": clamp_u64(wait.as_millis()),
            }),
            LimiterEvent::StoreUnavailable { key } => {
                json!({ "kind": "limiter_store_unavailable", "key": key })
            }
        },
        CourierEvent::Failover(fo) => match fo {
            FailoverEvent::Delivered { backend, duration } => json!({
                "kind": "failover_delivered",
                "backend": *backend,
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
            FailoverEvent::AttemptFailed { backend, consecutive_failures, timed_out } => json!({
                "kind": "failover_attempt_failed",
                "backend": *backend,
                "streak": *consecutive_failures,
                "timed_out": *timed_out,
            }),
            FailoverEvent::Demoted { from, to } => {
                json!({ "kind": "failover_demoted", "from": *from, "to": *to })
            }
            FailoverEvent::LimiterBypassed => json!({ "kind": "failover_limiter_bypassed" }),
        },
        CourierEvent::Batch(b) => match b {
            BatchEvent::DecodeFailed { partition, offset } => json!({
                "kind": "batch_decode_failed",
                "partition": *partition,
                "offset": *offset,
            }),
            BatchEvent::Dispatched { records, decoded, collected_in } => json!({
                "kind": "batch_dispatched",
                "records": *records,
                "decoded": *decoded,
                "collected_ms": clamp_u64(collected_in.as_millis()),
            }),
            BatchEvent::HandlerFailed { records } => {
                json!({ "kind": "batch_handler_failed", "records": *records })
            }
            BatchEvent::Acknowledged { records } => {
                json!({ "kind": "batch_acknowledged", "records": *records })
            }
        },
    }
}
