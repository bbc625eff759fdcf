// In-memory fakes for the external collaborators, shared across module
// tests, plus end-to-end tests of the client facade.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use rill_authz::PermissionEntry;
use rill_common::keys::decode_topic;
use rill_common::{ApiKeys, ClientError, MessageEvent, Record, RecordAck, Result};

use crate::broker::{BrokerProvider, RecordConsumer, RecordProducer};
use crate::consumer::MessageListener;
use crate::credentials::{ConnectionSettings, CredentialService};
use crate::feed::{DenialNotice, NotificationFeed};

pub(crate) fn test_keys() -> ApiKeys {
    ApiKeys::new(
        "pub-0a1b2c3d-4e5f-4a6b-8c9d-0e1f2a3b4c5d",
        "sub-0a1b2c3d-4e5f-4a6b-8c9d-0e1f2a3b4c5d",
        "s-0a1b2c3d-4e5f-4a6b-8c9d-0e1f2a3b4c5d",
    )
    .expect("test keys")
}

/// Producer that acks every send with a monotonically increasing offset.
pub(crate) struct FakeProducer {
    partitions: HashMap<String, Vec<i32>>,
    sent: Mutex<Vec<(String, i32, String, Bytes)>>,
    next_offset: AtomicI64,
}

impl FakeProducer {
    /// Topics are logical names; lookups strip the account-key prefix.
    pub(crate) fn new(topics: &[(&str, &[i32])]) -> Self {
        Self {
            partitions: topics
                .iter()
                .map(|(topic, partitions)| (topic.to_string(), partitions.to_vec()))
                .collect(),
            sent: Mutex::new(Vec::new()),
            next_offset: AtomicI64::new(0),
        }
    }

    pub(crate) fn sent(&self) -> Vec<(String, i32, String, Bytes)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl RecordProducer for FakeProducer {
    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>> {
        Ok(self
            .partitions
            .get(decode_topic(topic))
            .cloned()
            .unwrap_or_default())
    }

    async fn send(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        payload: Bytes,
    ) -> Result<RecordAck> {
        self.sent
            .lock()
            .push((topic.to_string(), partition, key.to_string(), payload));
        Ok(RecordAck {
            partition,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        })
    }
}

/// Consumer backed by a pushable record queue.
pub(crate) struct FakeConsumer {
    partitions: HashMap<String, Vec<i32>>,
    assigned: Mutex<Vec<(String, i32)>>,
    queue: Mutex<VecDeque<Record>>,
    notify: Notify,
    closed: AtomicBool,
}

impl FakeConsumer {
    /// Topics are encoded broker names, matching what `assign` receives.
    pub(crate) fn new(topics: &[(&str, &[i32])]) -> Self {
        Self {
            partitions: topics
                .iter()
                .map(|(topic, partitions)| (topic.to_string(), partitions.to_vec()))
                .collect(),
            assigned: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, record: Record) {
        self.queue.lock().push_back(record);
        self.notify.notify_one();
    }

    pub(crate) fn assigned(&self) -> Vec<(String, i32)> {
        let mut assigned = self.assigned.lock().clone();
        assigned.sort();
        assigned
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordConsumer for FakeConsumer {
    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>> {
        Ok(self.partitions.get(topic).cloned().unwrap_or_default())
    }

    fn assign(&self, assignment: &[(String, i32)]) -> Result<()> {
        *self.assigned.lock() = assignment.to_vec();
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>> {
        {
            let mut queue = self.queue.lock();
            if !queue.is_empty() {
                return Ok(queue.drain(..).collect());
            }
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        let mut queue = self.queue.lock();
        Ok(queue.drain(..).collect())
    }

    fn wake(&self) {
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Listener that records everything it receives.
#[derive(Default)]
pub(crate) struct CollectingListener {
    events: Mutex<Vec<MessageEvent>>,
    errors: Mutex<Vec<ClientError>>,
}

impl CollectingListener {
    pub(crate) fn events(&self) -> Vec<MessageEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn errors(&self) -> Vec<ClientError> {
        self.errors.lock().clone()
    }
}

impl MessageListener for CollectingListener {
    fn on_message(&self, event: MessageEvent) {
        self.events.lock().push(event);
    }

    fn on_error(&self, error: ClientError) {
        self.errors.lock().push(error);
    }
}

/// Feed that hands the subscription sender back to the test for emitting
/// denial notices, and records retained presence publishes.
#[derive(Default)]
pub(crate) struct FakeFeed {
    notices: Mutex<Option<mpsc::Sender<Bytes>>>,
    retained: Mutex<Vec<(String, Vec<u8>)>>,
    disconnected: AtomicBool,
}

impl FakeFeed {
    pub(crate) async fn emit(&self, notice: &DenialNotice) {
        let sender = self.notices.lock().clone();
        let sender = sender.expect("exceptions subscription registered");
        let payload = serde_json::to_vec(notice).expect("encode notice");
        sender.send(Bytes::from(payload)).await.expect("pump alive");
    }

    pub(crate) fn retained(&self) -> Vec<(String, Vec<u8>)> {
        self.retained.lock().clone()
    }

    pub(crate) fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationFeed for FakeFeed {
    async fn subscribe_exceptions(&self, notices: mpsc::Sender<Bytes>) -> Result<()> {
        *self.notices.lock() = Some(notices);
        Ok(())
    }

    async fn publish_retained(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.retained.lock().push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.notices.lock().take();
        Ok(())
    }
}

pub(crate) struct FakeCredentials {
    settings: ConnectionSettings,
    calls: Mutex<Vec<String>>,
}

impl FakeCredentials {
    pub(crate) fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CredentialService for FakeCredentials {
    async fn connect(&self, _keys: &ApiKeys) -> Result<ConnectionSettings> {
        Ok(self.settings.clone())
    }

    async fn permissions(
        &self,
        _keys: &ApiKeys,
        topic: Option<&str>,
    ) -> Result<Vec<PermissionEntry>> {
        Ok(self
            .settings
            .permissions
            .iter()
            .filter(|entry| topic.is_none() || topic == Some(entry.topic.as_str()))
            .cloned()
            .collect())
    }

    async fn grant(
        &self,
        _keys: &ApiKeys,
        user: &str,
        topic: &str,
        channel: Option<i32>,
        read: bool,
        write: bool,
        _ttl: Option<Duration>,
    ) -> Result<()> {
        self.calls
            .lock()
            .push(format!("grant {user} {topic} {channel:?} {read} {write}"));
        Ok(())
    }

    async fn revoke(
        &self,
        _keys: &ApiKeys,
        user: &str,
        topic: &str,
        channel: Option<i32>,
    ) -> Result<()> {
        self.calls
            .lock()
            .push(format!("revoke {user} {topic} {channel:?}"));
        Ok(())
    }
}

/// Provider returning the same fake connections for every endpoint.
pub(crate) struct FakeProvider {
    pub(crate) producer: Arc<FakeProducer>,
    pub(crate) consumer: Arc<FakeConsumer>,
}

impl BrokerProvider for FakeProvider {
    fn producer(&self, _endpoint: &str) -> Result<Arc<dyn RecordProducer>> {
        Ok(Arc::clone(&self.producer) as Arc<dyn RecordProducer>)
    }

    fn consumer(&self, _endpoint: &str, _group: &str) -> Result<Arc<dyn RecordConsumer>> {
        Ok(Arc::clone(&self.consumer) as Arc<dyn RecordConsumer>)
    }
}

mod end_to_end {
    use super::*;
    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::feed::{PRESENCE_OFFLINE, PRESENCE_ONLINE};
    use rill_crypto::PayloadCipher;

    const CIPHER_KEY: &str = "0123456789abcdef";

    fn settings(permissions: Vec<PermissionEntry>) -> ConnectionSettings {
        ConnectionSettings {
            token: "tok-1".to_string(),
            publish_endpoints: vec!["broker-a:9092".to_string()],
            subscribe_endpoints: vec!["broker-a:9092".to_string()],
            permissions,
        }
    }

    fn short_config() -> ClientConfig {
        ClientConfig {
            pending_ack_ttl: Duration::from_millis(150),
            learned_denial_ttl: Duration::from_millis(500),
            poll_timeout: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    struct Harness {
        client: Client,
        producer: Arc<FakeProducer>,
        consumer: Arc<FakeConsumer>,
        feed: Arc<FakeFeed>,
    }

    async fn connect(permissions: Vec<PermissionEntry>, topics: &[(&str, &[i32])]) -> Harness {
        let producer = Arc::new(FakeProducer::new(topics));
        let encoded: Vec<(String, Vec<i32>)> = topics
            .iter()
            .map(|(topic, partitions)| {
                (test_keys().encode_sub_topic(topic), partitions.to_vec())
            })
            .collect();
        let encoded_refs: Vec<(&str, &[i32])> = encoded
            .iter()
            .map(|(topic, partitions)| (topic.as_str(), partitions.as_slice()))
            .collect();
        let consumer = Arc::new(FakeConsumer::new(&encoded_refs));
        let feed = Arc::new(FakeFeed::default());
        let client = Client::connect(
            test_keys(),
            Some(CIPHER_KEY),
            short_config(),
            Arc::new(FakeCredentials::new(settings(permissions))),
            Arc::new(FakeProvider {
                producer: Arc::clone(&producer),
                consumer: Arc::clone(&consumer),
            }),
            Arc::clone(&feed) as Arc<dyn NotificationFeed>,
        )
        .await
        .expect("connect");
        Harness {
            client,
            producer,
            consumer,
            feed,
        }
    }

    #[tokio::test]
    async fn connect_publishes_online_presence() {
        let harness = connect(Vec::new(), &[]).await;
        let retained = harness.feed.retained();
        assert_eq!(retained.len(), 1);
        assert_eq!(
            retained[0].0,
            format!("presence/{}/tok-1", test_keys().pub_key())
        );
        assert_eq!(retained[0].1, vec![PRESENCE_ONLINE]);
        assert_eq!(harness.client.token(), "tok-1");
    }

    #[tokio::test]
    async fn publish_resolves_optimistically_without_denials() {
        let harness = connect(Vec::new(), &[("orders", &[0])]).await;
        let ack = harness
            .client
            .publish("orders", Some(0), b"payload", None)
            .await
            .expect("publish");
        let meta = ack.wait().await.expect("optimistic success");
        assert_eq!(meta.channels, 1);
        assert_eq!(harness.producer.sent().len(), 1);
    }

    #[tokio::test]
    async fn feed_denial_fails_the_publish_and_teaches_the_cache() {
        let harness = connect(Vec::new(), &[("orders", &[0])]).await;
        let ack = harness
            .client
            .publish("orders", Some(0), b"payload", None)
            .await
            .expect("publish");
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness
            .feed
            .emit(&DenialNotice {
                topic: "orders".to_string(),
                channel: 0,
                offset: 0,
                code: 1,
            })
            .await;
        let err = ack.wait().await.expect_err("denied");
        assert!(matches!(err, ClientError::LateDenial { .. }));
        // The denial is now learned; the next publish fails locally.
        let err = harness
            .client
            .publish("orders", Some(0), b"payload", None)
            .await
            .expect_err("fast fail");
        assert!(matches!(err, ClientError::LearnedDenial { .. }));
        assert_eq!(harness.producer.sent().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_delivers_decrypted_messages() {
        let harness = connect(
            vec![PermissionEntry::new("orders").grant(0, true, true)],
            &[("orders", &[0, 1])],
        )
        .await;
        let listener = Arc::new(CollectingListener::default());
        let meta = harness
            .client
            .subscribe("orders", "group-1", None, listener.clone())
            .await
            .expect("subscribe");
        assert_eq!(meta.channels, vec![0]);

        let cipher = PayloadCipher::new(CIPHER_KEY).expect("cipher");
        harness.consumer.push(Record {
            topic: test_keys().encode_sub_topic("orders"),
            partition: 0,
            offset: 3,
            timestamp: 1_700_000_000,
            payload: Bytes::from(cipher.seal(b"exactly sixteen.").into_bytes()),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = listener.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "orders");
        assert_eq!(events[0].payload.as_ref(), b"exactly sixteen.");
    }

    #[tokio::test]
    async fn shutdown_publishes_offline_presence_and_closes_consumers() {
        let harness = connect(
            vec![PermissionEntry::new("orders").grant(0, true, false)],
            &[("orders", &[0])],
        )
        .await;
        let listener = Arc::new(CollectingListener::default());
        harness
            .client
            .subscribe("orders", "group-1", None, listener)
            .await
            .expect("subscribe");
        harness.client.shutdown().await.expect("shutdown");
        assert!(harness.feed.disconnected());
        assert!(harness.consumer.closed());
        let retained = harness.feed.retained();
        assert_eq!(retained.last().expect("presence").1, vec![PRESENCE_OFFLINE]);
        // Shutdown is idempotent and later calls are rejected cleanly.
        harness.client.shutdown().await.expect("second shutdown");
        let err = harness
            .client
            .publish("orders", Some(0), b"payload", None)
            .await
            .expect_err("disconnected");
        assert_eq!(err, ClientError::NotConnected);
    }

    #[tokio::test]
    async fn permissions_are_fetched_fresh_and_scoped() {
        let harness = connect(
            vec![
                PermissionEntry::new("orders").grant(0, true, true),
                PermissionEntry::new("audit").grant(0, true, false),
            ],
            &[],
        )
        .await;
        let all = harness.client.permissions(None).await.expect("all");
        assert_eq!(all.len(), 2);
        let scoped = harness
            .client
            .permissions(Some("audit"))
            .await
            .expect("scoped");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].topic, "audit");
        let topics = harness.client.topics();
        assert_eq!(topics.len(), 2);
    }

    #[tokio::test]
    async fn short_cipher_key_fails_before_any_network_activity() {
        let feed = Arc::new(FakeFeed::default());
        let err = Client::connect(
            test_keys(),
            Some("short"),
            short_config(),
            Arc::new(FakeCredentials::new(settings(Vec::new()))),
            Arc::new(FakeProvider {
                producer: Arc::new(FakeProducer::new(&[])),
                consumer: Arc::new(FakeConsumer::new(&[])),
            }),
            feed.clone() as Arc<dyn NotificationFeed>,
        )
        .await
        .expect_err("cipher key too short");
        assert_eq!(err, ClientError::InvalidCipherKey);
        assert!(feed.retained().is_empty());
    }

    #[tokio::test]
    async fn grant_and_revoke_pass_through_to_the_service() {
        let credentials = Arc::new(FakeCredentials::new(settings(Vec::new())));
        let client = Client::connect(
            test_keys(),
            None,
            short_config(),
            Arc::clone(&credentials) as Arc<dyn CredentialService>,
            Arc::new(FakeProvider {
                producer: Arc::new(FakeProducer::new(&[])),
                consumer: Arc::new(FakeConsumer::new(&[])),
            }),
            Arc::new(FakeFeed::default()) as Arc<dyn NotificationFeed>,
        )
        .await
        .expect("connect");
        client
            .grant("alice", "orders", Some(0), true, false, None)
            .await
            .expect("grant");
        client
            .revoke("alice", "orders", Some(0))
            .await
            .expect("revoke");
        assert_eq!(credentials.calls().len(), 2);
    }
}
