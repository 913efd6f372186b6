//! Query Module
//!
//! The predicate interface consumed by blockfiles. The full query language is
//! provided by an external evaluator; this module carries only the trait and
//! the handful of time-based predicates the daemon's debug routes accept.

use crate::packet::Packet;
use crate::{Result, TrackerError};
use std::fmt;
use std::sync::Arc;

/// A predicate evaluated against the packets of a single blockfile
pub trait Query: Send + Sync + fmt::Debug {
    /// True if the packet satisfies the predicate
    fn matches(&self, packet: &Packet) -> bool;

    /// True if the predicate matches every packet, letting callers skip
    /// per-packet evaluation
    fn matches_all(&self) -> bool {
        false
    }
}

/// Matches every packet
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Query for MatchAll {
    fn matches(&self, _packet: &Packet) -> bool {
        true
    }

    fn matches_all(&self) -> bool {
        true
    }
}

/// Half-open capture-time window `[after_us, before_us)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub after_us: Option<i64>,
    pub before_us: Option<i64>,
}

impl Query for TimeRange {
    fn matches(&self, packet: &Packet) -> bool {
        self.after_us.map_or(true, |after| packet.timestamp_us >= after)
            && self.before_us.map_or(true, |before| packet.timestamp_us < before)
    }

    fn matches_all(&self) -> bool {
        self.after_us.is_none() && self.before_us.is_none()
    }
}

/// Parse `all | after <us> | before <us>` clauses joined by `and`
pub fn parse_query(input: &str) -> Result<Arc<dyn Query>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TrackerError::QueryError("empty query".to_string()));
    }

    let mut range = TimeRange::default();
    for clause in input.split(" and ") {
        let mut words = clause.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("all"), None, None) => {}
            (Some("after"), Some(value), None) => range.after_us = Some(parse_micros(value)?),
            (Some("before"), Some(value), None) => range.before_us = Some(parse_micros(value)?),
            _ => {
                return Err(TrackerError::QueryError(format!(
                    "unrecognised clause: {:?}",
                    clause.trim()
                )))
            }
        }
    }

    if range.matches_all() {
        Ok(Arc::new(MatchAll))
    } else {
        Ok(Arc::new(range))
    }
}

fn parse_micros(value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| TrackerError::QueryError(format!("bad timestamp {:?}: {}", value, e)))
}
