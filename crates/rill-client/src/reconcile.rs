// Publish-acknowledgment reconciliation.
//
// A broker ack only proves delivery to storage; the policy layer may still
// reject the record and report it later on the notification feed. The engine
// holds every acked-but-unconfirmed publish in a TTL table: a denial notice
// fails it early, TTL expiry with no denial resolves it as success. Denials
// are also cached negatively so repeat publishes to a known-bad destination
// fail without a round trip.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use rill_common::{ClientError, DenialReason};

use crate::feed::DenialNotice;
use crate::timed_map::TimedMap;

/// Identity of one in-flight publish: the broker ack coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub topic: String,
    pub channel: i32,
    pub offset: i64,
}

/// Denial cache key; one entry covers every offset on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub topic: String,
    pub channel: i32,
}

pub type PublishOutcome = std::result::Result<(), ClientError>;

/// Invoked once per publish with the terminal outcome, alongside the reply.
pub type PublishCallback = Arc<dyn Fn(&PendingKey, &PublishOutcome) + Send + Sync>;

/// One registered publish awaiting its terminal state.
pub struct PendingPublish {
    reply: oneshot::Sender<PublishOutcome>,
    callback: Option<PublishCallback>,
}

impl PendingPublish {
    pub fn new(reply: oneshot::Sender<PublishOutcome>, callback: Option<PublishCallback>) -> Self {
        Self { reply, callback }
    }

    fn resolve(self, key: &PendingKey, outcome: PublishOutcome) {
        if let Some(callback) = &self.callback {
            callback(key, &outcome);
        }
        // The caller may have dropped the receiver; resolution stays valid.
        let _ = self.reply.send(outcome);
    }
}

/// Owns the pending-publish table and the learned-denial cache.
///
/// Every entry reaches a terminal state exactly once: removal from the table
/// is the commit point, so the timeout path and the denial path can never
/// both fire for one key. Resolving a key that is no longer present is a
/// silent no-op, which makes `on_denial` idempotent under replays and
/// ack/denial races.
pub struct ReconcileEngine {
    pending: TimedMap<PendingKey, PendingPublish>,
    learned: TimedMap<ChannelKey, DenialReason>,
    pending_ttl: Duration,
    learned_ttl: Duration,
}

impl ReconcileEngine {
    pub fn new(pending_ttl: Duration, learned_ttl: Duration) -> Arc<Self> {
        let pending = TimedMap::with_listener(Arc::new(
            |key: &PendingKey, entry: PendingPublish| {
                // No denial arrived inside the window: assume success.
                tracing::debug!(
                    topic = %key.topic,
                    channel = key.channel,
                    offset = key.offset,
                    "pending publish expired; resolving optimistically"
                );
                metrics::counter!("rill_publish_resolved_optimistic").increment(1);
                entry.resolve(key, Ok(()));
            },
        ));
        Arc::new(Self {
            pending,
            learned: TimedMap::new(),
            pending_ttl,
            learned_ttl,
        })
    }

    /// Records an acked publish; the entry resolves via denial or TTL.
    pub fn register_pending(&self, key: PendingKey, entry: PendingPublish) {
        self.pending.put(key, entry, self.pending_ttl);
        metrics::gauge!("rill_publish_pending").set(self.pending.len() as f64);
    }

    /// Handles one notice from the feed. Two independent steps, both
    /// unconditional on every call:
    /// first-seen denials for the channel are learned and broadly fail every
    /// pending offset on that channel; the exact offset is then failed if it
    /// is still pending (it may have been registered after the sweep).
    pub fn on_denial(&self, notice: &DenialNotice) {
        let reason = notice.reason();
        let channel_key = ChannelKey {
            topic: notice.topic.clone(),
            channel: notice.channel,
        };
        if !self.learned.contains_key(&channel_key) {
            self.learned
                .put(channel_key.clone(), reason, self.learned_ttl);
            tracing::debug!(
                topic = %channel_key.topic,
                channel = channel_key.channel,
                code = notice.code,
                "learned denial"
            );
            metrics::counter!("rill_denials_learned").increment(1);
            let drained = self.pending.remove_where(|key| {
                key.topic == channel_key.topic && key.channel == channel_key.channel
            });
            for (key, entry) in drained {
                self.fail(key, entry, reason);
            }
        }
        let exact = PendingKey {
            topic: notice.topic.clone(),
            channel: notice.channel,
            offset: notice.offset,
        };
        if let Some(entry) = self.pending.remove(&exact) {
            self.fail(exact, entry, reason);
        }
        metrics::gauge!("rill_publish_pending").set(self.pending.len() as f64);
    }

    /// Publisher fast-path: a live cache entry means the destination denied
    /// a publish within the learning window.
    pub fn check_learned(&self, topic: &str, channel: i32) -> Option<DenialReason> {
        self.learned.get(&ChannelKey {
            topic: topic.to_string(),
            channel,
        })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn fail(&self, key: PendingKey, entry: PendingPublish, reason: DenialReason) {
        metrics::counter!("rill_publish_resolved_denied").increment(1);
        let failure = ClientError::LateDenial {
            topic: key.topic.clone(),
            channel: key.channel,
            offset: key.offset,
            reason,
        };
        entry.resolve(&key, Err(failure));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::sleep;

    fn notice(topic: &str, channel: i32, offset: i64) -> DenialNotice {
        DenialNotice {
            topic: topic.to_string(),
            channel,
            offset,
            code: 1,
        }
    }

    fn register(
        engine: &ReconcileEngine,
        topic: &str,
        channel: i32,
        offset: i64,
        outcomes: &Arc<Mutex<Vec<PublishOutcome>>>,
    ) -> oneshot::Receiver<PublishOutcome> {
        let (tx, rx) = oneshot::channel();
        let sink = Arc::clone(outcomes);
        let callback: PublishCallback = Arc::new(move |_key, outcome| {
            sink.lock().push(outcome.clone());
        });
        engine.register_pending(
            PendingKey {
                topic: topic.to_string(),
                channel,
                offset,
            },
            PendingPublish::new(tx, Some(callback)),
        );
        rx
    }

    #[tokio::test]
    async fn ttl_expiry_without_denial_is_success_exactly_once() {
        let engine = ReconcileEngine::new(Duration::from_millis(40), Duration::from_secs(20));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let rx = register(&engine, "orders", 0, 7, &outcomes);
        assert_eq!(rx.await.expect("resolved"), Ok(()));
        sleep(Duration::from_millis(120)).await;
        assert_eq!(outcomes.lock().len(), 1);
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn exact_denial_fails_before_ttl_and_stays_terminal() {
        let engine = ReconcileEngine::new(Duration::from_millis(80), Duration::from_secs(20));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let rx = register(&engine, "orders", 0, 7, &outcomes);
        engine.on_denial(&notice("orders", 0, 7));
        let outcome = rx.await.expect("resolved");
        assert_eq!(
            outcome,
            Err(ClientError::LateDenial {
                topic: "orders".to_string(),
                channel: 0,
                offset: 7,
                reason: DenialReason::NoWritePermission,
            })
        );
        // Past the original TTL: the callback must not fire again.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(outcomes.lock().len(), 1);
    }

    #[tokio::test]
    async fn first_denial_broadly_fails_every_pending_offset() {
        let engine = ReconcileEngine::new(Duration::from_secs(5), Duration::from_secs(20));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let rx1 = register(&engine, "orders", 2, 10, &outcomes);
        let rx2 = register(&engine, "orders", 2, 11, &outcomes);
        let rx3 = register(&engine, "orders", 3, 12, &outcomes);
        engine.on_denial(&notice("orders", 2, 11));
        assert!(rx1.await.expect("rx1").is_err());
        assert!(rx2.await.expect("rx2").is_err());
        // A different channel is untouched.
        assert_eq!(engine.pending_len(), 1);
        engine.on_denial(&notice("orders", 3, 12));
        assert!(rx3.await.expect("rx3").is_err());
        assert_eq!(outcomes.lock().len(), 3);
    }

    #[tokio::test]
    async fn denial_after_broad_sweep_still_fails_late_registrations() {
        let engine = ReconcileEngine::new(Duration::from_secs(5), Duration::from_secs(20));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        // The channel is already learned from a prior offset.
        engine.on_denial(&notice("orders", 0, 1));
        let rx = register(&engine, "orders", 0, 2, &outcomes);
        engine.on_denial(&notice("orders", 0, 2));
        assert!(rx.await.expect("resolved").is_err());
    }

    #[tokio::test]
    async fn denial_with_nothing_pending_is_a_silent_noop() {
        let engine = ReconcileEngine::new(Duration::from_secs(5), Duration::from_secs(20));
        engine.on_denial(&notice("orders", 0, 99));
        engine.on_denial(&notice("orders", 0, 99));
        assert_eq!(
            engine.check_learned("orders", 0),
            Some(DenialReason::NoWritePermission)
        );
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn learned_denial_expires_after_its_window() {
        let engine = ReconcileEngine::new(Duration::from_secs(5), Duration::from_millis(60));
        engine.on_denial(&notice("orders", 0, 1));
        assert!(engine.check_learned("orders", 0).is_some());
        assert!(engine.check_learned("orders", 1).is_none());
        sleep(Duration::from_millis(150)).await;
        assert!(engine.check_learned("orders", 0).is_none());
    }

    #[tokio::test]
    async fn repeat_denials_do_not_extend_the_learning_window() {
        let engine = ReconcileEngine::new(Duration::from_secs(5), Duration::from_millis(100));
        engine.on_denial(&notice("orders", 0, 1));
        sleep(Duration::from_millis(50)).await;
        engine.on_denial(&notice("orders", 0, 2));
        sleep(Duration::from_millis(100)).await;
        assert!(engine.check_learned("orders", 0).is_none());
    }
}
