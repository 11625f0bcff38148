//! Per-client routing state and token-bucket rate limiting.
//!
//! Each client holds a bucket refilled once per minute to a capacity of
//! `requests_per_minute × priority multiplier`. Tokens never go negative;
//! an empty bucket is an explicit `RateLimited` rejection upstream.

use streamfleet_types::{ClientId, ClientPriority, NodeId};

/// Length of one rate-limit window in seconds.
pub const WINDOW_SECS: u64 = 60;

/// Routing state for one client: priority, current assignment, and the
/// rate-limit bucket. Created lazily on first request.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub priority: ClientPriority,
    /// Connections currently held against the assigned node.
    pub connection_count: u32,
    /// Unix timestamp (seconds) of the last routing or release call.
    pub last_activity: u64,
    pub tokens: u32,
    /// Start of the current rate-limit window.
    pub window_started: u64,
    pub assigned_node: Option<NodeId>,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<ClientId>, requests_per_minute: u32, now: u64) -> Self {
        let priority = ClientPriority::Medium;
        Self {
            client_id: client_id.into(),
            priority,
            connection_count: 0,
            last_activity: now,
            tokens: capacity(requests_per_minute, priority),
            window_started: now,
            assigned_node: None,
        }
    }

    /// Take one token, refilling first if the window has rolled over.
    /// Returns false when the bucket is empty.
    pub fn try_acquire(&mut self, now: u64, requests_per_minute: u32) -> bool {
        if now.saturating_sub(self.window_started) >= WINDOW_SECS {
            self.tokens = capacity(requests_per_minute, self.priority);
            self.window_started = now;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

/// Bucket capacity for a priority tier: floor(rpm × multiplier).
pub fn capacity(requests_per_minute: u32, priority: ClientPriority) -> u32 {
    (requests_per_minute as f64 * priority.multiplier()).floor() as u32
}
