// Data carried across the client API surface and the broker seam.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A decrypted message delivered to subscribers.
///
/// `topic` is the logical name with the account-key prefix already stripped;
/// `channel` is the broker partition the record arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub topic: String,
    pub channel: i32,
    pub payload: Bytes,
    pub offset: i64,
    pub timestamp: i64,
}

/// A raw record as the broker seam hands it over, before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub payload: Bytes,
}

/// Broker acknowledgement for a single produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAck {
    pub partition: i32,
    pub offset: i64,
}

/// Returned from a publish call once the send is accepted locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubMeta {
    pub topic: String,
    pub channels: u32,
}

/// Describes one active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMeta {
    pub topic: String,
    pub group: String,
    pub channels: Vec<i32>,
    pub endpoints: Vec<String>,
}

/// Topic visibility as granted by the account's permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMeta {
    pub topic: String,
    pub channels: Vec<i32>,
}
