use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Process-wide counters exposed by `GET /stat`.
#[derive(Debug, Default)]
pub struct Stats {
    connection_rpc: AtomicI64,
    push_sessions: AtomicI64,
    rows_notified: AtomicI64,
}

/// Point-in-time copy of [`Stats`], serialised with the original
/// implementation's field names.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatsSnapshot {
    #[serde(rename = "ConnectionRPC")]
    pub connection_rpc: i64,
    pub push_sessions: i64,
    pub rows_notified: i64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_push_session(&self) {
        self.push_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows_notified(&self, n: i64) {
        self.rows_notified.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connection_rpc: self.connection_rpc.load(Ordering::Relaxed),
            push_sessions: self.push_sessions.load(Ordering::Relaxed),
            rows_notified: self.rows_notified.load(Ordering::Relaxed),
        }
    }
}

/// Scope guard for the active-RPC-connection counter: increments on accept
/// and decrements when the handler exits, including unwind paths.
pub struct ConnectionGuard {
    stats: Arc<Stats>,
}

impl ConnectionGuard {
    pub fn new(stats: Arc<Stats>) -> Self {
        stats.connection_rpc.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_rpc.fetch_sub(1, Ordering::Relaxed);
    }
}
