//! Convenient re-exports for common Courier types.
pub use crate::{
    batch::{
        BatchConfig, BatchConsumer, BatchHandler, ChannelRecord, ChannelStream, Decoder,
        EmptyBatchPolicy, RecordPosition, RecordStream, StreamRecord,
    },
    error::{BoxError, ConfigError, ConsumerError, DecodeError, DispatchError, LimiterError},
    failover::{Backend, DispatcherConfig, FailoverDispatcher, LogBackend, Notification},
    rate_limit::{
        store::{CounterStore, InMemoryCounterStore, OptimisticCounterStore, WindowStore},
        Decision, FixedKey, PrefixedKey, RateLimitError, RateLimitLayer, RateLimiter,
        SlidingWindowConfig, SlidingWindowLimiter, StoreFailurePolicy,
    },
    telemetry::{CourierEvent, LogSink, MemorySink, NullSink, TelemetrySink},
};

#[cfg(feature = "json")]
pub use crate::batch::JsonDecoder;
