//! Kafka record stream for `courier` (companion crate).
//! Bring your own `StreamConsumer`, or build one with [`KafkaRecordStream::subscribe`].
//!
//! Offsets are *stored* when the batch consumer acknowledges a record and committed by
//! librdkafka's auto-commit, so `enable.auto.offset.store` must be `false`: otherwise records
//! would be committed on receipt, before their batch was handled.

use async_trait::async_trait;
use courier::batch::{RecordPosition, RecordStream, StreamRecord};
use courier::error::BoxError;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::ClientConfig;

/// A message received from Kafka, detached from the consumer's buffer.
#[derive(Debug)]
pub struct KafkaRecord {
    message: OwnedMessage,
}

impl KafkaRecord {
    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.message.key()
    }

    pub fn message(&self) -> &OwnedMessage {
        &self.message
    }
}

impl From<OwnedMessage> for KafkaRecord {
    fn from(message: OwnedMessage) -> Self {
        Self { message }
    }
}

impl StreamRecord for KafkaRecord {
    fn position(&self) -> RecordPosition {
        RecordPosition::new(self.message.partition(), self.message.offset())
    }

    fn payload(&self) -> Option<&[u8]> {
        self.message.payload()
    }
}

pub struct KafkaRecordStream {
    consumer: StreamConsumer,
}

impl std::fmt::Debug for KafkaRecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaRecordStream").finish_non_exhaustive()
    }
}

impl KafkaRecordStream {
    /// Wrap an already subscribed consumer. It must run with `enable.auto.offset.store=false`.
    pub fn new(consumer: StreamConsumer) -> Self {
        Self { consumer }
    }

    /// Join `group_id` on `brokers` and subscribe to `topics`, starting from the earliest
    /// offset when the group has none.
    pub fn subscribe(brokers: &str, group_id: &str, topics: &[&str]) -> Result<Self, BoxError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()?;
        consumer.subscribe(topics)?;
        tracing::info!(target: "courier::kafka", group_id, ?topics, "subscribed");
        Ok(Self { consumer })
    }

    pub fn consumer(&self) -> &StreamConsumer {
        &self.consumer
    }
}

#[async_trait]
impl RecordStream for KafkaRecordStream {
    type Record = KafkaRecord;

    async fn next(&mut self) -> Result<Option<KafkaRecord>, BoxError> {
        let message = self.consumer.recv().await?;
        Ok(Some(KafkaRecord::from(message.detach())))
    }

    fn mark_consumed(&mut self, record: &KafkaRecord) -> Result<(), BoxError> {
        // The stored offset is the next one to read.
        self.consumer.store_offset(
            record.topic(),
            record.message.partition(),
            record.message.offset() + 1,
        )?;
        Ok(())
    }
}
