//! Timeout-bounded batch consumption.
//!
//! A [`BatchConsumer`] drains a [`RecordStream`] into batches of at most `batch_size` records,
//! flushing early when `batch_window` elapses. Each batch is decoded, handed to a
//! [`BatchHandler`] exactly once, and then every raw record in it is acknowledged, whether or
//! not decoding or handling succeeded. A record is never acknowledged before its batch has
//! been handled.
//!
//! ```
//! use courier::batch::{BatchConsumer, BatchConfig, ChannelRecord, ChannelStream};
//! use courier::error::BoxError;
//! use futures::future::BoxFuture;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (tx, stream) = ChannelStream::channel(16);
//! let acks = stream.ack_log();
//! for offset in 0..3 {
//!     tx.send(ChannelRecord::new(0, offset, offset.to_string())).await.unwrap();
//! }
//! drop(tx);
//!
//! let decode = |bytes: &[u8]| {
//!     std::str::from_utf8(bytes)
//!         .map(str::to_owned)
//!         .map_err(|e| courier::error::DecodeError::Malformed(Box::new(e)))
//! };
//! let config = BatchConfig::new(2, Duration::from_secs(1)).unwrap();
//! let consumer = BatchConsumer::new(config, decode);
//!
//! type Done = BoxFuture<'static, Result<(), BoxError>>;
//! let handler = |_: &[ChannelRecord], payloads: Vec<String>| -> Done {
//!     Box::pin(async move {
//!         println!("{payloads:?}");
//!         Ok(())
//!     })
//! };
//! consumer.run(stream, handler).await.unwrap();
//!
//! // The trailing partial batch is not acknowledged when the stream closes.
//! assert_eq!(acks.len(), 2);
//! # }
//! ```

pub mod decode;
pub mod stream;

pub use decode::Decoder;
#[cfg(feature = "json")]
pub use decode::JsonDecoder;
pub use stream::{AckLog, ChannelRecord, ChannelStream, RecordPosition, RecordStream, StreamRecord};

use crate::error::{BoxError, ConfigError, ConsumerError, DecodeError};
use crate::telemetry::{emit_best_effort, BatchEvent, CourierEvent, NullSink, TelemetrySink};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time::Instant;

/// Records per batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Longest time spent collecting one batch unless configured otherwise.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_secs(1);

/// What to do when the batch window closes with nothing collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EmptyBatchPolicy {
    /// Start the next window without calling the handler.
    #[default]
    Skip,
    /// Call the handler with an empty batch (a heartbeat).
    Invoke,
}

/// Validated batch settings. Deserializing goes through [`BatchConfig::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawBatchConfig"))]
pub struct BatchConfig {
    batch_size: usize,
    batch_window: Duration,
    empty_batch: EmptyBatchPolicy,
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawBatchConfig {
    batch_size: usize,
    batch_window: Duration,
    #[serde(default)]
    empty_batch: EmptyBatchPolicy,
}

#[cfg(feature = "serde")]
impl TryFrom<RawBatchConfig> for BatchConfig {
    type Error = ConfigError;

    fn try_from(raw: RawBatchConfig) -> Result<Self, Self::Error> {
        Ok(Self::new(raw.batch_size, raw.batch_window)?.with_empty_batch_policy(raw.empty_batch))
    }
}

impl BatchConfig {
    pub fn new(batch_size: usize, batch_window: Duration) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if batch_window.is_zero() {
            return Err(ConfigError::ZeroBatchWindow);
        }
        Ok(Self { batch_size, batch_window, empty_batch: EmptyBatchPolicy::default() })
    }

    pub fn with_empty_batch_policy(mut self, policy: EmptyBatchPolicy) -> Self {
        self.empty_batch = policy;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_window(&self) -> Duration {
        self.batch_window
    }

    pub fn empty_batch_policy(&self) -> EmptyBatchPolicy {
        self.empty_batch
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_window: DEFAULT_BATCH_WINDOW,
            empty_batch: EmptyBatchPolicy::default(),
        }
    }
}

/// Raw records of one cycle plus the payloads that decoded.
///
/// Raw records are unique by [`RecordPosition`]; a redelivered record is kept once.
#[derive(Debug)]
pub struct Batch<R, T> {
    records: Vec<R>,
    payloads: Vec<T>,
    seen: HashSet<RecordPosition>,
}

impl<R, T> Batch<R, T>
where
    R: StreamRecord,
{
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            payloads: Vec::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, position: RecordPosition) -> bool {
        self.seen.contains(&position)
    }

    /// Add a raw record. Returns `false` if a record at the same position is already present.
    pub fn push_record(&mut self, record: R) -> bool {
        if !self.seen.insert(record.position()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn push_payload(&mut self, payload: T) {
        self.payloads.push(payload);
    }

    /// Raw record count; this is what `batch_size` bounds.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn payloads(&self) -> &[T] {
        &self.payloads
    }

    pub fn into_parts(self) -> (Vec<R>, Vec<T>) {
        (self.records, self.payloads)
    }
}

/// Application logic run once per batch.
///
/// An error is logged and the batch is still acknowledged; handlers that need redelivery
/// must arrange it themselves.
#[async_trait]
pub trait BatchHandler<R, T>: Send + Sync {
    async fn handle(&self, records: &[R], payloads: Vec<T>) -> Result<(), BoxError>;
}

#[async_trait]
impl<R, T, F> BatchHandler<R, T> for F
where
    F: Fn(&[R], Vec<T>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync,
    R: Sync + 'static,
    T: Send + 'static,
{
    async fn handle(&self, records: &[R], payloads: Vec<T>) -> Result<(), BoxError> {
        (self)(records, payloads).await
    }
}

/// Drains a [`RecordStream`] in size- and time-bounded batches.
pub struct BatchConsumer<T, D, K = NullSink> {
    config: BatchConfig,
    decoder: D,
    sink: K,
    _payload: PhantomData<fn() -> T>,
}

impl<T, D> BatchConsumer<T, D, NullSink>
where
    D: Decoder<T>,
{
    pub fn new(config: BatchConfig, decoder: D) -> Self {
        Self { config, decoder, sink: NullSink, _payload: PhantomData }
    }

    pub fn builder(decoder: D) -> BatchConsumerBuilder<T, D> {
        BatchConsumerBuilder::new(decoder)
    }
}

impl<T, D, K> std::fmt::Debug for BatchConsumer<T, D, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchConsumer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<T, D, K> BatchConsumer<T, D, K>
where
    T: Send + 'static,
    D: Decoder<T>,
    K: TelemetrySink,
{
    /// Attach a telemetry sink.
    pub fn with_sink<K2: TelemetrySink>(self, sink: K2) -> BatchConsumer<T, D, K2> {
        BatchConsumer { config: self.config, decoder: self.decoder, sink, _payload: PhantomData }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Consume until the stream closes or fails.
    pub async fn run<S, H>(&self, stream: S, handler: H) -> Result<(), ConsumerError>
    where
        S: RecordStream,
        H: BatchHandler<S::Record, T>,
    {
        self.run_until(stream, handler, std::future::pending()).await
    }

    /// Consume until the stream closes, fails, or `shutdown` resolves.
    ///
    /// On close or shutdown the partially collected batch is dropped unacknowledged, so its
    /// records are redelivered to the next consumer. A read or acknowledgment failure is
    /// returned as [`ConsumerError::Stream`].
    pub async fn run_until<S, H, F>(
        &self,
        mut stream: S,
        handler: H,
        shutdown: F,
    ) -> Result<(), ConsumerError>
    where
        S: RecordStream,
        H: BatchHandler<S::Record, T>,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        // Every cycle must wait on the stream or the deadline at least once.
        let batch_size = self.config.batch_size.max(1);

        loop {
            let started = Instant::now();
            let deadline = tokio::time::sleep(self.config.batch_window);
            tokio::pin!(deadline);
            let mut batch = Batch::with_capacity(batch_size);

            while batch.len() < batch_size {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => {
                        tracing::debug!(
                            target: "courier::batch",
                            pending = batch.len(),
                            "shutdown requested; dropping partial batch"
                        );
                        return Ok(());
                    }
                    _ = &mut deadline => break,
                    next = stream.next() => match next {
                        Ok(Some(record)) => self.collect(&mut batch, record).await,
                        Ok(None) => {
                            tracing::debug!(
                                target: "courier::batch",
                                pending = batch.len(),
                                "stream closed; dropping partial batch"
                            );
                            return Ok(());
                        }
                        Err(e) => return Err(ConsumerError::Stream(e)),
                    },
                }
            }

            if batch.is_empty() && self.config.empty_batch == EmptyBatchPolicy::Skip {
                tracing::trace!(target: "courier::batch", "window closed with no records");
                continue;
            }

            let (records, payloads) = batch.into_parts();
            self.dispatch(&handler, &records, payloads, started.elapsed()).await;
            self.acknowledge(&mut stream, &records).await?;
        }
    }

    async fn collect<R>(&self, batch: &mut Batch<R, T>, record: R)
    where
        R: StreamRecord,
    {
        let position = record.position();
        if batch.contains(position) {
            tracing::debug!(
                target: "courier::batch",
                partition = position.partition,
                offset = position.offset,
                "duplicate record in batch; ignoring"
            );
            return;
        }

        let decoded = match record.payload() {
            Some(bytes) => self.decoder.decode(bytes),
            None => Err(DecodeError::MissingPayload),
        };
        batch.push_record(record);

        match decoded {
            Ok(payload) => batch.push_payload(payload),
            Err(error) => {
                tracing::error!(
                    target: "courier::batch",
                    partition = position.partition,
                    offset = position.offset,
                    %error,
                    "failed to decode record"
                );
                emit_best_effort(
                    self.sink.clone(),
                    CourierEvent::Batch(BatchEvent::DecodeFailed {
                        partition: position.partition,
                        offset: position.offset,
                    }),
                )
                .await;
            }
        }
    }

    async fn dispatch<R, H>(
        &self,
        handler: &H,
        records: &[R],
        payloads: Vec<T>,
        collected_in: Duration,
    ) where
        R: StreamRecord,
        H: BatchHandler<R, T>,
    {
        let decoded = payloads.len();
        tracing::debug!(
            target: "courier::batch",
            records = records.len(),
            decoded,
            ?collected_in,
            "dispatching batch"
        );
        emit_best_effort(
            self.sink.clone(),
            CourierEvent::Batch(BatchEvent::Dispatched {
                records: records.len(),
                decoded,
                collected_in,
            }),
        )
        .await;

        if let Err(error) = handler.handle(records, payloads).await {
            let first = records.first().map(|r| r.position());
            let last = records.last().map(|r| r.position());
            tracing::error!(
                target: "courier::batch",
                records = records.len(),
                first = ?first,
                last = ?last,
                %error,
                "batch handler failed; acknowledging anyway"
            );
            emit_best_effort(
                self.sink.clone(),
                CourierEvent::Batch(BatchEvent::HandlerFailed { records: records.len() }),
            )
            .await;
        }
    }

    async fn acknowledge<S>(
        &self,
        stream: &mut S,
        records: &[S::Record],
    ) -> Result<(), ConsumerError>
    where
        S: RecordStream,
    {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            stream.mark_consumed(record).map_err(ConsumerError::Stream)?;
        }
        tracing::debug!(target: "courier::batch", records = records.len(), "batch acknowledged");
        emit_best_effort(
            self.sink.clone(),
            CourierEvent::Batch(BatchEvent::Acknowledged { records: records.len() }),
        )
        .await;
        Ok(())
    }
}

/// Builder for [`BatchConsumer`].
pub struct BatchConsumerBuilder<T, D> {
    decoder: D,
    batch_size: usize,
    batch_window: Duration,
    empty_batch: EmptyBatchPolicy,
    _payload: PhantomData<fn() -> T>,
}

impl<T, D> BatchConsumerBuilder<T, D>
where
    D: Decoder<T>,
{
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_window: DEFAULT_BATCH_WINDOW,
            empty_batch: EmptyBatchPolicy::default(),
            _payload: PhantomData,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn batch_window(mut self, batch_window: Duration) -> Self {
        self.batch_window = batch_window;
        self
    }

    pub fn empty_batch(mut self, policy: EmptyBatchPolicy) -> Self {
        self.empty_batch = policy;
        self
    }

    pub fn build(self) -> Result<BatchConsumer<T, D>, ConfigError> {
        let config = BatchConfig::new(self.batch_size, self.batch_window)?
            .with_empty_batch_policy(self.empty_batch);
        Ok(BatchConsumer::new(config, self.decoder))
    }
}
