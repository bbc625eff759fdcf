// Permission-scoped group consumer.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rill_authz::PermissionSet;
use rill_common::keys::decode_topic;
use rill_common::{ApiKeys, ClientError, MessageEvent, Result, Record, SubMeta};
use rill_crypto::PayloadCipher;

use crate::broker::RecordConsumer;

/// Receives decoded messages and per-record errors for subscribed channels.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, event: MessageEvent);
    fn on_error(&self, error: ClientError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Assigned,
    Running,
    Stopping,
    Closed,
}

/// One consumer per (group, broker endpoint).
///
/// Owns its broker handle and assignment map exclusively. The assignment is
/// always recomputed from the full map on subscribe/unsubscribe, never
/// diffed incrementally.
pub struct GroupConsumer {
    group: String,
    endpoint: String,
    consumer: Arc<dyn RecordConsumer>,
    permissions: Arc<PermissionSet>,
    cipher: Option<PayloadCipher>,
    keys: ApiKeys,
    poll_timeout: Duration,
    assignment: Mutex<HashMap<String, HashMap<i32, Arc<dyn MessageListener>>>>,
    state: Mutex<ConsumerState>,
    alive: AtomicBool,
}

impl GroupConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: impl Into<String>,
        endpoint: impl Into<String>,
        consumer: Arc<dyn RecordConsumer>,
        permissions: Arc<PermissionSet>,
        cipher: Option<PayloadCipher>,
        keys: ApiKeys,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            group: group.into(),
            endpoint: endpoint.into(),
            consumer,
            permissions,
            cipher,
            keys,
            poll_timeout,
            assignment: Mutex::new(HashMap::new()),
            state: Mutex::new(ConsumerState::Created),
            alive: AtomicBool::new(true),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Attaches `listener` to the permission-filtered channel set of `topic`
    /// and pushes the recomputed full assignment to the broker.
    pub async fn subscribe(
        &self,
        topic: &str,
        channel: Option<i32>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<SubMeta> {
        if matches!(
            self.state(),
            ConsumerState::Stopping | ConsumerState::Closed
        ) {
            return Err(ClientError::ConsumerClosed);
        }
        let encoded = self.keys.encode_sub_topic(topic);
        let partitions = self.consumer.partitions_for(&encoded).await?;
        let granted = self
            .permissions
            .readable_channels(topic, channel, &partitions)?;
        {
            let mut assignment = self.assignment.lock();
            let listeners = assignment.entry(encoded).or_default();
            for granted_channel in &granted {
                listeners.insert(*granted_channel, Arc::clone(&listener));
            }
            self.reassign(&assignment)?;
        }
        {
            let mut state = self.state.lock();
            if *state == ConsumerState::Created {
                *state = ConsumerState::Assigned;
            }
        }
        metrics::counter!("rill_subscribe_requests").increment(1);
        Ok(SubMeta {
            topic: topic.to_string(),
            group: self.group.clone(),
            channels: granted.into_iter().collect(),
            endpoints: vec![self.endpoint.clone()],
        })
    }

    /// Detaches one channel, or the whole topic when `channel` is `None`,
    /// and reassigns. Unknown topics are a no-op.
    pub fn unsubscribe(&self, topic: &str, channel: Option<i32>) -> Result<()> {
        let encoded = self.keys.encode_sub_topic(topic);
        let mut assignment = self.assignment.lock();
        match channel {
            None => {
                assignment.remove(&encoded);
            }
            Some(channel) => {
                if let Some(listeners) = assignment.get_mut(&encoded) {
                    listeners.remove(&channel);
                    if listeners.is_empty() {
                        assignment.remove(&encoded);
                    }
                }
            }
        }
        self.reassign(&assignment)
    }

    /// Poll/dispatch loop; returns when `shutdown` is observed.
    ///
    /// Records are handled synchronously in arrival order per poll batch.
    /// Poll failures are reported to every attached listener and the loop
    /// keeps going; only shutdown ends it.
    pub async fn run(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ConsumerState::Created | ConsumerState::Assigned => {
                    *state = ConsumerState::Running;
                }
                _ => return Err(ClientError::ConsumerClosed),
            }
        }
        while self.alive.load(Ordering::Acquire) {
            match self.consumer.poll(self.poll_timeout).await {
                Ok(records) => {
                    for record in records {
                        self.handle(record);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        group = %self.group,
                        endpoint = %self.endpoint,
                        error = %err,
                        "consumer poll failed"
                    );
                    self.notify_error(err);
                }
            }
        }
        self.consumer.close();
        *self.state.lock() = ConsumerState::Closed;
        tracing::debug!(group = %self.group, endpoint = %self.endpoint, "consumer closed");
        Ok(())
    }

    /// Idempotent; unblocks a poll in progress.
    pub fn shutdown(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let mut state = self.state.lock();
            if *state == ConsumerState::Running {
                *state = ConsumerState::Stopping;
            }
            drop(state);
            self.consumer.wake();
        }
    }

    fn reassign(&self, assignment: &HashMap<String, HashMap<i32, Arc<dyn MessageListener>>>) -> Result<()> {
        let full: Vec<(String, i32)> = assignment
            .iter()
            .flat_map(|(encoded, listeners)| {
                listeners
                    .keys()
                    .map(|channel| (encoded.clone(), *channel))
            })
            .collect();
        self.consumer.assign(&full)
    }

    fn handle(&self, record: Record) {
        let listener = {
            let assignment = self.assignment.lock();
            assignment
                .get(&record.topic)
                .and_then(|listeners| listeners.get(&record.partition))
                .cloned()
        };
        let Some(listener) = listener else {
            // Possible after an unsubscribe raced an in-flight batch.
            tracing::debug!(
                topic = %record.topic,
                partition = record.partition,
                "dropping record for unassigned channel"
            );
            return;
        };
        let payload = match &self.cipher {
            Some(cipher) => match cipher.open(&record.payload) {
                Ok(clear) => Bytes::from(clear),
                // Failed base64 or block alignment marks a record that
                // predates encryption; deliver it unchanged. Corrupted
                // ciphertext is indistinguishable from legacy plaintext.
                Err(_) => record.payload.clone(),
            },
            None => record.payload.clone(),
        };
        metrics::counter!("rill_records_dispatched").increment(1);
        listener.on_message(MessageEvent {
            topic: decode_topic(&record.topic).to_string(),
            channel: record.partition,
            payload,
            offset: record.offset,
            timestamp: record.timestamp,
        });
    }

    fn notify_error(&self, error: ClientError) {
        let listeners: Vec<Arc<dyn MessageListener>> = {
            let assignment = self.assignment.lock();
            assignment
                .values()
                .flat_map(|listeners| listeners.values().cloned())
                .collect()
        };
        for listener in listeners {
            listener.on_error(error.clone());
        }
    }
}
