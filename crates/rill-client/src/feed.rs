// Side notification feed: denial notices and presence.
//
// The policy service reports violations on an MQTT-like feed, decoupled from
// the broker that acknowledged the publish. Notices are pumped over an
// explicit channel into the reconciliation engine so the feed transport
// stays swappable and testable.
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rill_common::{ClientError, DenialReason, Result};

use crate::reconcile::ReconcileEngine;

/// Well-known feed topic carrying denial notices for the account.
pub const EXCEPTIONS_TOPIC: &str = "exceptions";

/// Retained presence payloads; the offline byte doubles as the last will.
pub const PRESENCE_ONLINE: u8 = 0x01;
pub const PRESENCE_OFFLINE: u8 = 0x00;

pub fn presence_topic(pub_key: &str, token: &str) -> String {
    format!("presence/{pub_key}/{token}")
}

/// One decoded denial notice from the exceptions topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialNotice {
    pub topic: String,
    pub channel: i32,
    pub offset: i64,
    pub code: u32,
}

impl DenialNotice {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| ClientError::MalformedPayload(format!("denial notice: {err}")))
    }

    pub fn reason(&self) -> DenialReason {
        DenialReason::from_code(self.code)
    }
}

/// Feed transport boundary.
///
/// Implementations register the offline presence byte as the connection's
/// last will at connect time; the client publishes the online byte itself.
#[async_trait]
pub trait NotificationFeed: Send + Sync {
    /// Routes raw exception payloads into `notices` until disconnect.
    async fn subscribe_exceptions(&self, notices: mpsc::Sender<Bytes>) -> Result<()>;

    /// Publishes a retained message, replacing any earlier retained payload
    /// on the same feed topic.
    async fn publish_retained(&self, topic: &str, payload: &[u8]) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Forwards decoded notices into the engine until the feed side closes.
///
/// A disconnected feed simply ends the pump: no denials are observed and
/// every pending publish resolves optimistically at TTL.
pub(crate) fn spawn_denial_pump(
    mut notices: mpsc::Receiver<Bytes>,
    engine: Arc<ReconcileEngine>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = notices.recv().await {
            match DenialNotice::decode(&payload) {
                Ok(notice) => engine.on_denial(&notice),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping undecodable denial notice");
                }
            }
        }
        tracing::debug!("denial feed closed; degrading to optimistic resolution");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_decodes_from_feed_json() {
        let notice =
            DenialNotice::decode(br#"{"topic":"orders","channel":1,"offset":42,"code":1}"#)
                .expect("decode");
        assert_eq!(
            notice,
            DenialNotice {
                topic: "orders".to_string(),
                channel: 1,
                offset: 42,
                code: 1,
            }
        );
        assert_eq!(notice.reason(), DenialReason::NoWritePermission);
    }

    #[test]
    fn malformed_notice_is_a_typed_error() {
        let err = DenialNotice::decode(b"not json").expect_err("garbage");
        assert!(matches!(err, ClientError::MalformedPayload(_)));
    }

    #[test]
    fn presence_topic_is_scoped_to_key_and_token() {
        assert_eq!(
            presence_topic("pub-abc", "tok-1"),
            "presence/pub-abc/tok-1"
        );
    }
}
