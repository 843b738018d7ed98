//! Telemetry for courier components.
//!
//! Every component emits structured [`CourierEvent`]s describing admissions, delivery
//! attempts, backend rotation and batch lifecycle. Events flow through `TelemetrySink`
//! implementations which can log, buffer, or forward them to external systems.
//!
//! # Event Types
//!
//! - **Limiter**: `Admitted`, `Denied`, `StoreUnavailable`
//! - **Failover**: `Delivered`, `AttemptFailed`, `Demoted`, `LimiterBypassed`
//! - **Batch**: `DecodeFailed`, `Dispatched`, `HandlerFailed`, `Acknowledged`
//!
//! # Telemetry Sinks
//!
//! `TelemetrySink` is a `tower::Service<CourierEvent>` so sinks compose with the rest of the
//! tower ecosystem. Emission is best-effort: sink errors are swallowed.

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::{BatchEvent, CourierEvent, FailoverEvent, LimiterEvent};
pub use sinks::{
    emit_best_effort, ComposedSinkError, LogSink, MemorySink, MulticastSink, NullSink,
    TelemetrySink,
};
