//! Record streams the batch consumer drains.

use crate::error::BoxError;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Where a record lives in its stream. Two records with the same position are the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

impl RecordPosition {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A raw record as delivered by a stream.
pub trait StreamRecord: Send + Sync + 'static {
    fn position(&self) -> RecordPosition;

    /// Payload bytes; `None` for records without a body (e.g. tombstones).
    fn payload(&self) -> Option<&[u8]>;
}

/// An ordered, acknowledgeable source of records.
#[async_trait]
pub trait RecordStream: Send {
    type Record: StreamRecord;

    /// Wait for the next record. `Ok(None)` means the stream is closed.
    ///
    /// Must be cancel-safe: the consumer drops this future when its deadline or shutdown
    /// signal wins the race, and no record may be lost when that happens.
    async fn next(&mut self) -> Result<Option<Self::Record>, BoxError>;

    /// Mark `record` as processed so it is not redelivered.
    fn mark_consumed(&mut self, record: &Self::Record) -> Result<(), BoxError>;
}

/// Record carried by a [`ChannelStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    position: RecordPosition,
    payload: Option<Vec<u8>>,
}

impl ChannelRecord {
    pub fn new(partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self { position: RecordPosition::new(partition, offset), payload: Some(payload.into()) }
    }

    /// A record with no payload.
    pub fn tombstone(partition: i32, offset: i64) -> Self {
        Self { position: RecordPosition::new(partition, offset), payload: None }
    }
}

impl StreamRecord for ChannelRecord {
    fn position(&self) -> RecordPosition {
        self.position
    }

    fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// Positions acknowledged on a [`ChannelStream`], in acknowledgment order.
#[derive(Debug, Clone, Default)]
pub struct AckLog {
    acked: Arc<Mutex<Vec<RecordPosition>>>,
}

impl AckLog {
    fn push(&self, position: RecordPosition) {
        self.acked.lock().unwrap_or_else(PoisonError::into_inner).push(position);
    }

    pub fn positions(&self) -> Vec<RecordPosition> {
        self.acked.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.acked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, position: RecordPosition) -> bool {
        self.acked.lock().unwrap_or_else(PoisonError::into_inner).contains(&position)
    }
}

/// In-process stream over a bounded `tokio::sync::mpsc` channel.
///
/// The stream closes once every sender is dropped and the buffer is drained.
#[derive(Debug)]
pub struct ChannelStream {
    rx: mpsc::Receiver<ChannelRecord>,
    acks: AckLog,
}

impl ChannelStream {
    /// Create a stream and the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<ChannelRecord>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx, acks: AckLog::default() })
    }

    /// Shared view of acknowledged positions; stays valid after the stream is consumed.
    pub fn ack_log(&self) -> AckLog {
        self.acks.clone()
    }
}

#[async_trait]
impl RecordStream for ChannelStream {
    type Record = ChannelRecord;

    async fn next(&mut self) -> Result<Option<ChannelRecord>, BoxError> {
        Ok(self.rx.recv().await)
    }

    fn mark_consumed(&mut self, record: &ChannelRecord) -> Result<(), BoxError> {
        self.acks.push(record.position);
        Ok(())
    }
}
