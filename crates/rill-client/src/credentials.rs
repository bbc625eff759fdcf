// Interface to the credential/permission service.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use rill_authz::PermissionEntry;
use rill_common::{ApiKeys, Result};

/// Everything the service hands back for a validated key set: broker
/// endpoints per role, the session token, and the permission snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub token: String,
    pub publish_endpoints: Vec<String>,
    pub subscribe_endpoints: Vec<String>,
    pub permissions: Vec<PermissionEntry>,
}

/// Credential-service boundary. The HTTP transport lives outside this crate;
/// tests use an in-memory implementation.
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Consumed once at startup.
    async fn connect(&self, keys: &ApiKeys) -> Result<ConnectionSettings>;

    /// Fresh permission snapshot, optionally scoped to one topic.
    async fn permissions(&self, keys: &ApiKeys, topic: Option<&str>)
        -> Result<Vec<PermissionEntry>>;

    #[allow(clippy::too_many_arguments)]
    async fn grant(
        &self,
        keys: &ApiKeys,
        user: &str,
        topic: &str,
        channel: Option<i32>,
        read: bool,
        write: bool,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn revoke(
        &self,
        keys: &ApiKeys,
        user: &str,
        topic: &str,
        channel: Option<i32>,
    ) -> Result<()>;
}
