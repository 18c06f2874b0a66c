use log::{ info, warn };
use std::sync::Arc;

use crate::commands::now_in_offset;
use crate::history::HistoryStore;
use crate::models::chat::UsageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageLimits {
    /// Zero disables the limit.
    pub daily_requests: u64,
    pub daily_tokens: u64,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            daily_requests: 200,
            daily_tokens: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageDecision {
    Allowed,
    Exhausted(UsageRecord),
}

/// Rough token count used for the daily counters: one token per four chars.
pub fn estimate_tokens(chars: usize) -> u64 {
    chars.div_ceil(4) as u64
}

/// Soft per-user daily limits backed by the history store. A store failure
/// never blocks a request.
pub struct UsageLimiter {
    store: Arc<dyn HistoryStore>,
    limits: UsageLimits,
    utc_offset_hours: i32,
}

impl UsageLimiter {
    pub fn new(store: Arc<dyn HistoryStore>, limits: UsageLimits, utc_offset_hours: i32) -> Self {
        Self {
            store,
            limits,
            utc_offset_hours,
        }
    }

    pub fn today(&self) -> String {
        now_in_offset(self.utc_offset_hours).format("%Y-%m-%d").to_string()
    }

    pub fn limits(&self) -> UsageLimits {
        self.limits
    }

    fn is_exhausted(&self, record: &UsageRecord) -> bool {
        (self.limits.daily_requests > 0 && record.requests >= self.limits.daily_requests) ||
            (self.limits.daily_tokens > 0 && record.tokens >= self.limits.daily_tokens)
    }

    pub async fn check(&self, user_id: &str) -> UsageDecision {
        match self.store.get_usage(user_id, &self.today()).await {
            Ok(record) if self.is_exhausted(&record) => {
                info!(
                    "User {} reached the daily limit ({} requests, {} tokens)",
                    user_id,
                    record.requests,
                    record.tokens
                );
                UsageDecision::Exhausted(record)
            }
            Ok(_) => UsageDecision::Allowed,
            Err(e) => {
                warn!("Could not read usage for {}: {}", user_id, e);
                UsageDecision::Allowed
            }
        }
    }

    pub async fn record(&self, user_id: &str, chars: usize) -> Option<UsageRecord> {
        match self.store.record_usage(user_id, &self.today(), estimate_tokens(chars)).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Could not record usage for {}: {}", user_id, e);
                None
            }
        }
    }

    pub async fn current(&self, user_id: &str) -> Result<UsageRecord, Box<dyn std::error::Error + Send + Sync>> {
        self.store.get_usage(user_id, &self.today()).await
    }
}
