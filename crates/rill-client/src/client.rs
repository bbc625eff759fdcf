// Client facade: connection lifecycle, publish/subscribe entry points.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rill_authz::{PermissionEntry, PermissionSet};
use rill_common::{ApiKeys, ClientError, Result, SubMeta, TopicMeta};
use rill_crypto::PayloadCipher;

use crate::broker::BrokerProvider;
use crate::config::ClientConfig;
use crate::consumer::{GroupConsumer, MessageListener};
use crate::credentials::CredentialService;
use crate::feed::{
    presence_topic, spawn_denial_pump, NotificationFeed, PRESENCE_OFFLINE, PRESENCE_ONLINE,
};
use crate::publisher::{PublishAck, Publisher};
use crate::reconcile::{PublishCallback, ReconcileEngine};

/// One authenticated connection to the messaging backend.
///
/// Holds the permission snapshot taken at connect time, the reconciliation
/// engine fed by the notification pump, one producer per publish endpoint
/// and one lazily created consumer per (group, subscribe endpoint).
pub struct Client {
    keys: ApiKeys,
    token: String,
    config: ClientConfig,
    permissions: Arc<PermissionSet>,
    cipher: Option<PayloadCipher>,
    publisher: Publisher,
    credentials: Arc<dyn CredentialService>,
    provider: Arc<dyn BrokerProvider>,
    feed: Arc<dyn NotificationFeed>,
    subscribe_endpoints: Vec<String>,
    groups: Mutex<HashMap<String, Vec<Arc<GroupConsumer>>>>,
    consumer_tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Authenticates, snapshots permissions, wires the denial pump and
    /// announces presence. Fails before any network activity when
    /// `cipher_key` is present but too short.
    pub async fn connect(
        keys: ApiKeys,
        cipher_key: Option<&str>,
        config: ClientConfig,
        credentials: Arc<dyn CredentialService>,
        provider: Arc<dyn BrokerProvider>,
        feed: Arc<dyn NotificationFeed>,
    ) -> Result<Self> {
        let cipher = match cipher_key {
            Some(key) => Some(PayloadCipher::new(key).ok_or(ClientError::InvalidCipherKey)?),
            None => None,
        };
        let settings = credentials.connect(&keys).await?;
        let permissions = Arc::new(PermissionSet::from_entries(settings.permissions));
        let engine = ReconcileEngine::new(config.pending_ack_ttl, config.learned_denial_ttl);

        let mut producers = Vec::with_capacity(settings.publish_endpoints.len());
        for endpoint in &settings.publish_endpoints {
            producers.push(provider.producer(endpoint)?);
        }
        let publisher = Publisher::new(
            producers,
            Arc::clone(&engine),
            Arc::clone(&permissions),
            cipher.clone(),
            keys.clone(),
            settings.token.clone(),
        );

        let (notice_tx, notice_rx) = mpsc::channel(config.denial_queue_depth);
        feed.subscribe_exceptions(notice_tx).await?;
        let pump = spawn_denial_pump(notice_rx, engine);

        feed.publish_retained(
            &presence_topic(keys.pub_key(), &settings.token),
            &[PRESENCE_ONLINE],
        )
        .await?;
        tracing::debug!(token = %settings.token, "client connected");

        Ok(Self {
            keys,
            token: settings.token,
            config,
            permissions,
            cipher,
            publisher,
            credentials,
            provider,
            feed,
            subscribe_endpoints: settings.subscribe_endpoints,
            groups: Mutex::new(HashMap::new()),
            consumer_tasks: Mutex::new(Vec::new()),
            pump: Mutex::new(Some(pump)),
            connected: AtomicBool::new(true),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Publishes to one channel, or to every partition when `channel` is
    /// `None`. The returned ack resolves once the publish reaches a terminal
    /// state in the reconciliation engine.
    pub async fn publish(
        &self,
        topic: &str,
        channel: Option<i32>,
        payload: &[u8],
        callback: Option<PublishCallback>,
    ) -> Result<PublishAck> {
        self.ensure_connected()?;
        self.publisher.publish(topic, channel, payload, callback).await
    }

    /// Subscribes `listener` within `group`, scoped to the channels the
    /// permission snapshot grants read on. Consumers for a new group are
    /// created against every subscribe endpoint and start polling
    /// immediately.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        channel: Option<i32>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<SubMeta> {
        self.ensure_connected()?;
        let consumers = self.group_consumers(group)?;
        let mut merged: Option<SubMeta> = None;
        for consumer in &consumers {
            let meta = consumer.subscribe(topic, channel, Arc::clone(&listener)).await?;
            merged = Some(match merged {
                None => meta,
                Some(mut acc) => {
                    acc.endpoints.extend(meta.endpoints);
                    acc
                }
            });
        }
        merged.ok_or(ClientError::NotConnected)
    }

    /// Detaches `topic` (or one channel of it) from every consumer in the
    /// group. Unknown groups are a no-op.
    pub fn unsubscribe(&self, topic: &str, group: &str, channel: Option<i32>) -> Result<()> {
        let consumers = self.groups.lock().get(group).cloned();
        if let Some(consumers) = consumers {
            for consumer in consumers {
                consumer.unsubscribe(topic, channel)?;
            }
        }
        Ok(())
    }

    /// Fetches current permissions from the credential service, bypassing
    /// the connect-time snapshot.
    pub async fn permissions(&self, topic: Option<&str>) -> Result<Vec<PermissionEntry>> {
        self.ensure_connected()?;
        self.credentials.permissions(&self.keys, topic).await
    }

    /// Topics visible in the connect-time snapshot.
    pub fn topics(&self) -> Vec<TopicMeta> {
        self.permissions.topics()
    }

    pub async fn grant(
        &self,
        user: &str,
        topic: &str,
        channel: Option<i32>,
        read: bool,
        write: bool,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.credentials
            .grant(&self.keys, user, topic, channel, read, write, ttl)
            .await
    }

    pub async fn revoke(&self, user: &str, topic: &str, channel: Option<i32>) -> Result<()> {
        self.ensure_connected()?;
        self.credentials.revoke(&self.keys, user, topic, channel).await
    }

    /// Orderly disconnect: offline presence, consumer drain, feed teardown.
    /// Idempotent; later API calls fail with `NotConnected`.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self
            .feed
            .publish_retained(
                &presence_topic(self.keys.pub_key(), &self.token),
                &[PRESENCE_OFFLINE],
            )
            .await
        {
            tracing::warn!(error = %err, "offline presence publish failed");
        }
        let consumers: Vec<Arc<GroupConsumer>> =
            self.groups.lock().values().flatten().cloned().collect();
        for consumer in consumers {
            consumer.shutdown();
        }
        let tasks: Vec<_> = self.consumer_tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "consumer task join failed");
            }
        }
        if let Err(err) = self.feed.disconnect().await {
            tracing::warn!(error = %err, "feed disconnect failed");
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        tracing::debug!(token = %self.token, "client shut down");
        Ok(())
    }

    fn group_consumers(&self, group: &str) -> Result<Vec<Arc<GroupConsumer>>> {
        let mut groups = self.groups.lock();
        if let Some(existing) = groups.get(group) {
            return Ok(existing.clone());
        }
        let mut created = Vec::with_capacity(self.subscribe_endpoints.len());
        for endpoint in &self.subscribe_endpoints {
            let handle = self.provider.consumer(endpoint, group)?;
            let consumer = Arc::new(GroupConsumer::new(
                group,
                endpoint,
                handle,
                Arc::clone(&self.permissions),
                self.cipher.clone(),
                self.keys.clone(),
                self.config.poll_timeout,
            ));
            let runner = Arc::clone(&consumer);
            self.consumer_tasks
                .lock()
                .push(tokio::spawn(async move { runner.run().await }));
            created.push(consumer);
        }
        groups.insert(group.to_string(), created.clone());
        Ok(created)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }
}
