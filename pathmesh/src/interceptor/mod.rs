// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! RPC boundary glue: metadata carriage, the overlap-detection cache, and the
//! client/server tracers.

mod client;
mod server;

pub use client::{ClientTracer, OutboundCall};
pub use server::{RequestScope, ServerTracer};

use crate::clock::Ticker;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Request metadata key carrying the trace id as a decimal string.
pub const TRACE_ID_KEY: &str = "trace_id";

/// Response metadata key carrying elapsed wall time as decimal nanoseconds.
pub const ELAPSED_TIME_KEY: &str = "elapsed_time";

/// Response metadata key carrying the serialized critical path blob.
pub const CRITICAL_PATH_KEY: &str = "critical_path-bin";

/// String-keyed metadata attached to RPC requests and responses.
///
/// The transport carries it opaquely alongside the message body; this crate
/// only ever reads and writes its three fixed keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    entries: HashMap<String, Bytes>,
}

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a string-valued entry.
    pub fn insert_str(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_owned(), Bytes::from(value.into()));
    }

    /// Returns a string-valued entry, if present and valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Inserts a binary-valued entry.
    pub fn insert_bin(&mut self, key: &str, value: Bytes) {
        self.entries.insert(key.to_owned(), value);
    }

    /// Returns a binary-valued entry, if present.
    pub fn get_bin(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }
}

const DEFAULT_CACHE_CAPACITY: usize = 1_000;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct CacheSlot {
    end_nanos: u64,
    written_nanos: u64,
}

/// Maps trace id to the most recent RPC end time seen for that trace, so the
/// client tracer can tell whether a new call's window overlaps the previous
/// one.
///
/// A process-wide singleton shared by every client tracer. Only a handful of
/// traces are live per minute, so the cache is capped at 1,000 entries to
/// bound memory and entries expire after one minute to still cover very slow
/// requests.
pub struct ParallelRpcMonitor {
    entries: DashMap<u64, CacheSlot>,
    capacity: usize,
    ttl_nanos: u64,
    ticker: Arc<dyn Ticker>,
}

impl ParallelRpcMonitor {
    /// Creates a monitor with the default bounds (1,000 entries, 1 minute).
    pub fn new(ticker: Arc<dyn Ticker>) -> Self {
        Self::with_limits(ticker, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }

    /// Creates a monitor with explicit bounds.
    pub fn with_limits(ticker: Arc<dyn Ticker>, capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl_nanos: ttl.as_nanos() as u64,
            ticker,
        }
    }

    /// The most recent RPC end time recorded for the trace, unless expired.
    pub fn last_end_nanos(&self, trace_id: u64) -> Option<u64> {
        let now = self.ticker.now_nanos();
        self.entries
            .get(&trace_id)
            .filter(|slot| now.saturating_sub(slot.written_nanos) <= self.ttl_nanos)
            .map(|slot| slot.end_nanos)
    }

    /// Advances the cached end time for the trace, keeping the newer value.
    pub fn advance(&self, trace_id: u64, end_nanos: u64) {
        let now = self.ticker.now_nanos();
        if !self.entries.contains_key(&trace_id) && self.entries.len() >= self.capacity {
            self.evict(now);
        }
        let mut slot = self.entries.entry(trace_id).or_insert(CacheSlot {
            end_nanos,
            written_nanos: now,
        });
        if slot.end_nanos < end_nanos {
            *slot = CacheSlot {
                end_nanos,
                written_nanos: now,
            };
        }
    }

    fn evict(&self, now: u64) {
        self.entries
            .retain(|_, slot| now.saturating_sub(slot.written_nanos) <= self.ttl_nanos);
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().written_nanos)
                .map(|entry| *entry.key());
            if let Some(trace_id) = oldest {
                self.entries.remove(&trace_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;

    #[test]
    fn metadata_round_trips_string_and_binary_entries() {
        let mut meta = Metadata::new();
        meta.insert_str(TRACE_ID_KEY, "42");
        meta.insert_bin(CRITICAL_PATH_KEY, Bytes::from_static(b"\x01\x02"));

        assert_eq!(meta.get_str(TRACE_ID_KEY), Some("42"));
        assert_eq!(meta.get_bin(CRITICAL_PATH_KEY).map(|b| b.as_ref()), Some(&b"\x01\x02"[..]));
        assert_eq!(meta.get_str(ELAPSED_TIME_KEY), None);
    }

    #[test]
    fn cache_keeps_the_newer_end_time() {
        let ticker = Arc::new(ManualTicker::new());
        let monitor = ParallelRpcMonitor::new(ticker.clone());

        monitor.advance(1, 500);
        monitor.advance(1, 300);
        assert_eq!(monitor.last_end_nanos(1), Some(500));
        monitor.advance(1, 900);
        assert_eq!(monitor.last_end_nanos(1), Some(900));
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let ticker = Arc::new(ManualTicker::new());
        let monitor = ParallelRpcMonitor::with_limits(ticker.clone(), 10, Duration::from_secs(1));

        monitor.advance(1, 100);
        ticker.set_nanos(2_000_000_000);
        assert_eq!(monitor.last_end_nanos(1), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let ticker = Arc::new(ManualTicker::new());
        let monitor = ParallelRpcMonitor::with_limits(ticker.clone(), 2, Duration::from_secs(60));

        monitor.advance(1, 100);
        ticker.set_nanos(10);
        monitor.advance(2, 200);
        ticker.set_nanos(20);
        monitor.advance(3, 300);

        assert_eq!(monitor.entries.len(), 2);
        // The oldest-written entry made room for the newest.
        assert_eq!(monitor.last_end_nanos(1), None);
        assert_eq!(monitor.last_end_nanos(3), Some(300));
    }
}
