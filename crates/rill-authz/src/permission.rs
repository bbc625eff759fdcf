//! Per-topic, per-channel grant evaluation.
//!
//! # Purpose
//! Defines the grant data structures and the snapshot queries used to gate
//! publish and subscribe calls before they reach the broker.
//!
//! # How it fits
//! The credential service returns one [`PermissionEntry`] per visible topic;
//! the client collects them into a [`PermissionSet`] and consults it on every
//! operation.
//!
//! # Key invariants
//! - Queries distinguish "topic unknown" from "topic known, access denied".
//! - A subscribe request is granted only when every requested channel is
//!   readable.
//!
//! # Examples
//! ```rust
//! use rill_authz::{PermissionEntry, PermissionSet};
//!
//! let entry = PermissionEntry::new("orders").grant(0, true, true);
//! let set = PermissionSet::from_entries(vec![entry]);
//! assert!(set.writable("orders", 0));
//! ```
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use rill_common::{ClientError, Result, TopicMeta};

/// Read/write flags for a single channel of a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelGrant {
    pub read: bool,
    pub write: bool,
}

/// Grants for one topic, keyed by channel number.
///
/// # Summary
/// The wire shape matches what the credential service returns: a topic name
/// and a sparse channel map. Channels absent from the map carry no access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub topic: String,
    #[serde(default)]
    pub channels: BTreeMap<i32, ChannelGrant>,
}

impl PermissionEntry {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channels: BTreeMap::new(),
        }
    }

    /// Add or replace the grant for one channel. Builder style, used by
    /// callers assembling entries by hand (mostly tests and fixtures).
    pub fn grant(mut self, channel: i32, read: bool, write: bool) -> Self {
        self.channels.insert(channel, ChannelGrant { read, write });
        self
    }

    fn readable(&self) -> BTreeSet<i32> {
        self.channels
            .iter()
            .filter(|(_, grant)| grant.read)
            .map(|(channel, _)| *channel)
            .collect()
    }
}

/// Immutable snapshot of every grant the account holds.
///
/// # Summary
/// Built once at connect time; replaced wholesale when grants are refreshed.
/// All queries are pure lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    entries: HashMap<String, PermissionEntry>,
}

impl PermissionSet {
    /// Build a snapshot from credential-service entries.
    ///
    /// # Parameters
    /// - `entries`: one entry per topic; later duplicates replace earlier
    ///   ones.
    pub fn from_entries(entries: Vec<PermissionEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.topic.clone(), entry))
            .collect();
        Self { entries }
    }

    /// Resolve the channel set a subscribe call may attach to.
    ///
    /// # Parameters
    /// - `topic`: logical topic name.
    /// - `requested`: `None` asks for every readable channel; `Some` names
    ///   one explicit channel.
    /// - `partitions`: the partitions the broker reports for the topic.
    ///
    /// # Returns
    /// - The granted channel set, never empty: the intersection of broker
    ///   partitions and readable grants, or the singleton requested channel.
    ///
    /// # Errors
    /// - [`ClientError::TopicNotFound`] when the broker reports no
    ///   partitions at all.
    /// - [`ClientError::NoPermission`] when the intersection is empty or the
    ///   requested channel is not both a real partition and readable.
    ///   Channel `-1` in the error stands for "any channel".
    pub fn readable_channels(
        &self,
        topic: &str,
        requested: Option<i32>,
        partitions: &[i32],
    ) -> Result<BTreeSet<i32>> {
        if partitions.is_empty() {
            return Err(ClientError::TopicNotFound(topic.to_string()));
        }
        // A topic missing from the snapshot is still a broker topic; it just
        // carries no grants.
        let readable = self
            .entries
            .get(topic)
            .map(|entry| entry.readable())
            .unwrap_or_default();
        match requested {
            None => {
                let granted: BTreeSet<i32> = readable
                    .into_iter()
                    .filter(|channel| partitions.contains(channel))
                    .collect();
                if granted.is_empty() {
                    return Err(ClientError::NoPermission {
                        topic: topic.to_string(),
                        channel: -1,
                    });
                }
                Ok(granted)
            }
            Some(channel) => {
                if !partitions.contains(&channel) || !readable.contains(&channel) {
                    return Err(ClientError::NoPermission {
                        topic: topic.to_string(),
                        channel,
                    });
                }
                Ok(BTreeSet::from([channel]))
            }
        }
    }

    /// True when the snapshot allows publishing to `topic` on `channel`.
    pub fn writable(&self, topic: &str, channel: i32) -> bool {
        self.entries
            .get(topic)
            .and_then(|entry| entry.channels.get(&channel))
            .map(|grant| grant.write)
            .unwrap_or(false)
    }

    /// Channels the snapshot allows publishing to for `topic`, in order.
    pub fn writable_channels(&self, topic: &str) -> Vec<i32> {
        self.entries
            .get(topic)
            .map(|entry| {
                entry
                    .channels
                    .iter()
                    .filter(|(_, grant)| grant.write)
                    .map(|(channel, _)| *channel)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every topic visible to the account, with its granted channels.
    pub fn topics(&self) -> Vec<TopicMeta> {
        let mut metas: Vec<TopicMeta> = self
            .entries
            .values()
            .map(|entry| TopicMeta {
                topic: entry.topic.clone(),
                channels: entry.channels.keys().copied().collect(),
            })
            .collect();
        metas.sort_by(|a, b| a.topic.cmp(&b.topic));
        metas
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
