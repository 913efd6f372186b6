//! Capture Tracker - blockfile discovery, merged lookups and disk-driven eviction
//!
//! This library tracks the blockfiles written by each packet capture thread,
//! answers queries across all of them as a single time-ordered stream, and
//! deletes the oldest blockfiles when the packet disk runs low on space.

pub mod blockfile;
pub mod config;
pub mod debug_server;
pub mod disk;
pub mod error;
pub mod health;
pub mod layout;
pub mod logging;
pub mod merge;
pub mod packet;
pub mod pcap_blockfile;
pub mod query;
pub mod scheduler;
pub mod shutdown;
pub mod tracker;

pub use error::{Result, TrackerError};
