// Interfaces to the stream-storage backend.
//
// The broker is an external collaborator: the client only consumes its
// delivery guarantees. Transports implement these traits; tests use
// in-memory fakes.
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use rill_common::{Record, RecordAck, Result};

/// Producer side of one broker connection.
///
/// `send` resolves with the broker's local acknowledgment; that ack is
/// necessary but not sufficient for success, since policy denials arrive
/// later on the notification feed.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Partitions the broker reports for an encoded topic; empty when the
    /// topic does not exist.
    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>>;

    async fn send(&self, topic: &str, partition: i32, key: &str, payload: Bytes)
        -> Result<RecordAck>;
}

/// Consumer side of one broker connection, owned by a single group consumer.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>>;

    /// Replaces the full (encoded topic, partition) assignment.
    fn assign(&self, assignment: &[(String, i32)]) -> Result<()>;

    /// Blocks up to `timeout` for the next batch; empty on timeout.
    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>>;

    /// Unblocks a poll in progress; used by shutdown.
    fn wake(&self);

    fn close(&self);
}

/// Builds broker connections from credential-service endpoint settings.
pub trait BrokerProvider: Send + Sync {
    fn producer(&self, endpoint: &str) -> Result<Arc<dyn RecordProducer>>;

    fn consumer(&self, endpoint: &str, group: &str) -> Result<Arc<dyn RecordConsumer>>;
}
