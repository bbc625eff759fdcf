// Permission-aware pub/sub client.
//
// Publishes and subscribes against a partitioned stream-storage backend whose
// authorization is enforced out-of-band: the policy service reports denials
// on a side notification feed instead of rejecting sends synchronously. The
// reconciliation engine correlates optimistic broker acknowledgments with
// possibly-later denials and resolves each publish exactly once.
pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod credentials;
pub mod feed;
pub mod publisher;
pub mod reconcile;
pub mod timed_map;

#[cfg(test)]
pub(crate) mod tests;

pub use broker::{BrokerProvider, RecordConsumer, RecordProducer};
pub use client::Client;
pub use config::ClientConfig;
pub use consumer::{ConsumerState, GroupConsumer, MessageListener};
pub use credentials::{ConnectionSettings, CredentialService};
pub use feed::{DenialNotice, NotificationFeed};
pub use publisher::{PublishAck, Publisher};
pub use reconcile::{ChannelKey, PendingKey, PublishCallback, ReconcileEngine};
pub use timed_map::TimedMap;

pub use rill_authz::{PermissionEntry, PermissionSet};
pub use rill_common::{
    ApiKeys, ClientError, DenialReason, MessageEvent, PubMeta, Record, RecordAck, Result, SubMeta,
    TopicMeta,
};
pub use rill_crypto::PayloadCipher;
