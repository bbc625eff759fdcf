//! Permission snapshot evaluation.
//!
//! # Purpose
//! Holds the account's per-topic, per-channel grants as fetched from the
//! credential service and answers read/write questions locally.
//!
//! # How it fits
//! The client fetches grants once at connect time and consults the resulting
//! [`PermissionSet`] before every publish and subscribe. Out-of-band denials
//! learned later are handled elsewhere; this crate only evaluates the
//! snapshot.
//!
//! # Key invariants
//! - Evaluation never performs I/O.
//! - An absent topic is distinct from a present topic with no readable
//!   channels.
pub mod permission;

pub use permission::{ChannelGrant, PermissionEntry, PermissionSet};
