use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Decoded reason behind a policy denial reported on the notification feed.
///
/// The feed carries numeric codes; unknown codes are preserved rather than
/// rejected so newer server-side reasons still resolve pending publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    NoWritePermission,
    NoReadPermission,
    TopicSuspended,
    QuotaExceeded,
    Unknown(u32),
}

impl DenialReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::NoWritePermission,
            2 => Self::NoReadPermission,
            3 => Self::TopicSuspended,
            4 => Self::QuotaExceeded,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::NoWritePermission => 1,
            Self::NoReadPermission => 2,
            Self::TopicSuspended => 3,
            Self::QuotaExceeded => 4,
            Self::Unknown(code) => *code,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::NoWritePermission => "no write permission for topic/channel",
            Self::NoReadPermission => "no read permission for topic/channel",
            Self::TopicSuspended => "topic is suspended by policy",
            Self::QuotaExceeded => "publish quota exceeded",
            Self::Unknown(_) => "denied by policy",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message(), self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("topic [{0}] does not exist")]
    TopicNotFound(String),
    #[error("no permission for topic [{topic}] channel {channel}")]
    NoPermission { topic: String, channel: i32 },
    #[error("publish to [{topic}] channel {channel} denied: {reason}")]
    LearnedDenial {
        topic: String,
        channel: i32,
        reason: DenialReason,
    },
    #[error("publish to [{topic}] channel {channel} offset {offset} rejected by policy: {reason}")]
    LateDenial {
        topic: String,
        channel: i32,
        offset: i64,
        reason: DenialReason,
    },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("invalid {kind} key: {detail}")]
    InvalidKey {
        kind: &'static str,
        detail: String,
    },
    #[error("cipher key must be at least 16 characters")]
    InvalidCipherKey,
    #[error("client is not connected to the service")]
    NotConnected,
    #[error("consumer is closed")]
    ConsumerClosed,
}
