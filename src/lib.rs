//! A storage daemon's tracker-facing control plane: cluster membership
//! reconciliation, tracker leader tracking, trunk allocator role control,
//! and replication cursor negotiation against a set of independent tracker
//! servers.
//!
//! The wire protocol lives in [`protocol`], the merge rules in
//! [`membership`], and the per-tracker session state machine in [`tracker`].

#![warn(clippy::all)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod membership;
pub mod protocol;
pub mod tracker;
pub mod transport;
pub mod workers;

pub use config::Config;
pub use error::{Error, Result};
