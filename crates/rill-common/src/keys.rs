// API-key validation and broker-visible topic encoding.
//
// The service hands out three keys: a publish key (`pub-<uuid>`), a subscribe
// key (`sub-<uuid>`) and a secret key (`s-<uuid>`). Broker-visible topic names
// are prefixed with the relevant key so a single cluster can multiplex
// accounts; the message key on send ties a record to the session token.
use uuid::Uuid;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeys {
    pub_key: String,
    sub_key: String,
    secret_key: String,
}

impl ApiKeys {
    /// Validates the three account keys. Fails before any network activity.
    pub fn new(
        pub_key: impl Into<String>,
        sub_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self> {
        let pub_key = pub_key.into();
        let sub_key = sub_key.into();
        let secret_key = secret_key.into();
        validate_key("publish", &pub_key, "pub-")?;
        validate_key("subscribe", &sub_key, "sub-")?;
        validate_key("secret", &secret_key, "s-")?;
        Ok(Self {
            pub_key,
            sub_key,
            secret_key,
        })
    }

    pub fn pub_key(&self) -> &str {
        &self.pub_key
    }

    pub fn sub_key(&self) -> &str {
        &self.sub_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// Broker topic name used on the publish side.
    pub fn encode_pub_topic(&self, topic: &str) -> String {
        format!("{}.{}", self.pub_key, topic)
    }

    /// Broker topic name used on the subscribe side.
    pub fn encode_sub_topic(&self, topic: &str) -> String {
        format!("{}.{}", self.sub_key, topic)
    }

    /// Record key attached to every send: `{secret_key}-{session_token}`.
    pub fn message_key(&self, token: &str) -> String {
        format!("{}-{}", self.secret_key, token)
    }
}

/// Strips the account-key prefix from a broker-visible topic name.
///
/// Returns the input unchanged when no prefix is present, so callers can feed
/// logical names through without re-checking.
pub fn decode_topic(encoded: &str) -> &str {
    match encoded.find('.') {
        Some(index) => &encoded[index + 1..],
        None => encoded,
    }
}

fn validate_key(kind: &'static str, key: &str, prefix: &str) -> Result<()> {
    let suffix = key.strip_prefix(prefix).ok_or_else(|| ClientError::InvalidKey {
        kind,
        detail: format!("expected `{prefix}<uuid>`"),
    })?;
    Uuid::parse_str(suffix).map_err(|_| ClientError::InvalidKey {
        kind,
        detail: "key suffix is not a valid uuid".to_string(),
    })?;
    Ok(())
}
