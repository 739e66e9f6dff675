//! Shared types for the API layer: context, rate limiter, WS tickets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core_state::CoreState;

/// Shared context for all routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub ws_tickets: Arc<Mutex<WsTicketStore>>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        let per_minute = core.config.rate_limit_per_user;
        Self {
            core,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(per_minute))),
            ws_tickets: Arc::new(Mutex::new(WsTicketStore::new())),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Rate limiter: per-user sliding window
// ═══════════════════════════════════════════════════════════

/// Per-user sliding-window limiter, enforced before inference admission.
pub struct RateLimiter {
    windows: HashMap<String, Vec<Instant>>,
    per_minute: u32,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            windows: HashMap::new(),
            per_minute,
        }
    }

    /// `Ok(())` or `Err(retry_after_secs)`.
    pub fn check(&mut self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let entries = self.windows.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < Duration::from_secs(60));

        if entries.len() as u32 >= self.per_minute {
            return Err(60);
        }
        entries.push(now);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// WS ticket store: one-time WebSocket upgrade tokens
// ═══════════════════════════════════════════════════════════

/// One-time WebSocket upgrade ticket (30-second TTL). Keeps the bearer
/// token out of WS query parameters.
struct WsTicket {
    username: String,
    expires_at: Instant,
}

pub struct WsTicketStore {
    tickets: HashMap<String, WsTicket>,
}

impl WsTicketStore {
    pub fn new() -> Self {
        Self {
            tickets: HashMap::new(),
        }
    }

    pub fn issue(&mut self, username: String) -> String {
        self.cleanup();
        let ticket = uuid::Uuid::new_v4().to_string();
        self.tickets.insert(
            ticket.clone(),
            WsTicket {
                username,
                expires_at: Instant::now() + Duration::from_secs(30),
            },
        );
        ticket
    }

    /// One-time use; returns the username on success.
    pub fn consume(&mut self, ticket: &str) -> Option<String> {
        let entry = self.tickets.remove(ticket)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.username)
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.tickets.retain(|_, t| now < t.expires_at);
    }
}

impl Default for WsTicketStore {
    fn default() -> Self {
        Self::new()
    }
}
