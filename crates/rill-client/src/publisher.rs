// Publish path: producer selection, encryption, engine hand-off.
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::oneshot;

use rill_authz::PermissionSet;
use rill_common::{ApiKeys, ClientError, PubMeta, Result};
use rill_crypto::PayloadCipher;

use crate::broker::RecordProducer;
use crate::reconcile::{
    PendingKey, PendingPublish, PublishCallback, PublishOutcome, ReconcileEngine,
};

/// Deferred result of one publish call.
///
/// Resolves only after every targeted partition reaches a terminal state in
/// the reconciliation engine: success once all partitions succeed, otherwise
/// the first failure.
#[derive(Debug)]
pub struct PublishAck {
    rx: oneshot::Receiver<Result<PubMeta>>,
}

impl PublishAck {
    pub async fn wait(self) -> Result<PubMeta> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(
                "publish result dropped".to_string(),
            )),
        }
    }
}

/// Sends records and registers their acks with the engine. Keeps no
/// per-message state of its own.
pub struct Publisher {
    producers: Vec<Arc<dyn RecordProducer>>,
    engine: Arc<ReconcileEngine>,
    permissions: Arc<PermissionSet>,
    cipher: Option<PayloadCipher>,
    keys: ApiKeys,
    token: String,
}

impl Publisher {
    pub fn new(
        producers: Vec<Arc<dyn RecordProducer>>,
        engine: Arc<ReconcileEngine>,
        permissions: Arc<PermissionSet>,
        cipher: Option<PayloadCipher>,
        keys: ApiKeys,
        token: impl Into<String>,
    ) -> Self {
        Self {
            producers,
            engine,
            permissions,
            cipher,
            keys,
            token: token.into(),
        }
    }

    /// Publishes to one channel, or to every partition of the topic when
    /// `channel` is `None` (fan-out).
    ///
    /// Known-bad destinations fail fast from the learned-denial cache, and
    /// write grants are checked best-effort when the local snapshot covers
    /// the topic; the backend stays authoritative via the feed. `callback`
    /// fires once per acked partition with its terminal outcome.
    pub async fn publish(
        &self,
        topic: &str,
        channel: Option<i32>,
        payload: &[u8],
        callback: Option<PublishCallback>,
    ) -> Result<PublishAck> {
        let producer = self.select_producer()?;
        let encoded = self.keys.encode_pub_topic(topic);
        let channels: Vec<i32> = match channel {
            Some(channel) => {
                if let Some(reason) = self.engine.check_learned(topic, channel) {
                    return Err(ClientError::LearnedDenial {
                        topic: topic.to_string(),
                        channel,
                        reason,
                    });
                }
                if self.permissions.contains_topic(topic)
                    && !self.permissions.writable(topic, channel)
                {
                    return Err(ClientError::NoPermission {
                        topic: topic.to_string(),
                        channel,
                    });
                }
                vec![channel]
            }
            None => {
                let partitions = producer.partitions_for(&encoded).await?;
                if partitions.is_empty() {
                    return Err(ClientError::TopicNotFound(topic.to_string()));
                }
                partitions
            }
        };
        metrics::counter!("rill_publish_requests").increment(1);

        let wire: Bytes = match &self.cipher {
            Some(cipher) => Bytes::from(cipher.seal(payload).into_bytes()),
            None => Bytes::copy_from_slice(payload),
        };
        let message_key = self.keys.message_key(&self.token);

        let mut waiters = Vec::with_capacity(channels.len());
        for partition in &channels {
            let partition = *partition;
            let (outcome_tx, outcome_rx) = oneshot::channel::<PublishOutcome>();
            waiters.push(outcome_rx);
            // Fan-out may mix healthy and denied partitions.
            if let Some(reason) = self.engine.check_learned(topic, partition) {
                let _ = outcome_tx.send(Err(ClientError::LearnedDenial {
                    topic: topic.to_string(),
                    channel: partition,
                    reason,
                }));
                continue;
            }
            let producer = Arc::clone(producer);
            let engine = Arc::clone(&self.engine);
            let encoded = encoded.clone();
            let message_key = message_key.clone();
            let wire = wire.clone();
            let topic = topic.to_string();
            let callback = callback.clone();
            tokio::spawn(async move {
                match producer.send(&encoded, partition, &message_key, wire).await {
                    Ok(ack) => {
                        // A denial may have been learned between the send and
                        // its local ack; registering it would only delay the
                        // same failure.
                        if let Some(reason) = engine.check_learned(&topic, partition) {
                            let _ = outcome_tx.send(Err(ClientError::LearnedDenial {
                                topic,
                                channel: partition,
                                reason,
                            }));
                            return;
                        }
                        engine.register_pending(
                            PendingKey {
                                topic,
                                channel: partition,
                                offset: ack.offset,
                            },
                            PendingPublish::new(outcome_tx, callback),
                        );
                    }
                    Err(err) => {
                        let _ = outcome_tx.send(Err(err));
                    }
                }
            });
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let meta = PubMeta {
            topic: topic.to_string(),
            channels: channels.len() as u32,
        };
        tokio::spawn(async move {
            let mut failure: Option<ClientError> = None;
            for waiter in waiters {
                match waiter.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                    Err(_) => {
                        if failure.is_none() {
                            failure = Some(ClientError::Transport(
                                "publish outcome dropped".to_string(),
                            ));
                        }
                    }
                }
            }
            let result = match failure {
                None => Ok(meta),
                Some(err) => Err(err),
            };
            let _ = ack_tx.send(result);
        });
        Ok(PublishAck { rx: ack_rx })
    }

    fn select_producer(&self) -> Result<&Arc<dyn RecordProducer>> {
        if self.producers.is_empty() {
            return Err(ClientError::NotConnected);
        }
        // Uniform-random pick when more than one broker connection exists.
        let index = if self.producers.len() == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.producers.len())
        };
        Ok(&self.producers[index])
    }
}
