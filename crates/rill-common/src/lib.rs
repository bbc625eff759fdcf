// Shared data types and small helpers used across the rill client crates.
pub mod error;
pub mod keys;
pub mod meta;

pub use error::{ClientError, DenialReason, Result};
pub use keys::ApiKeys;
pub use meta::{MessageEvent, PubMeta, Record, RecordAck, SubMeta, TopicMeta};
