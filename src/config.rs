//! Configuration options (§6): the complete list of options the scout
//! core recognizes. Modeled on `CacheConfig` in
//! `harborgrid-justin-rusty-db/src/cache/query_cache.rs` — a small,
//! serde-deserializable struct with a `Default` impl and an explicit
//! range-checked `validate()`, rather than a generic hierarchical
//! configuration manager.

use crate::error::{ScoutError, ScoutResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheUpdateProtocol {
    NoCacheOrUncoordinated,
    CausalNotificationsStream,
    CausalPeriodicRefresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutConfig {
    /// Comma-separated endpoints; first is primary. Stored pre-split for
    /// convenience.
    pub server_hostnames: Vec<String>,
    /// If true, reads use the disaster-durable committed clock.
    pub disaster_safe: bool,
    /// Allow multiple pending handles per scout.
    pub concurrent_open_transactions: bool,
    /// Backpressure threshold on the commit queue.
    pub max_async_transactions_queued: usize,
    /// Committer batch upper bound.
    pub max_commit_batch_size: usize,
    /// TTL for unused cache entries.
    pub cache_eviction_time_millis: u64,
    /// Cache capacity in entries.
    pub cache_size: usize,
    pub cache_update_protocol: CacheUpdateProtocol,
    /// Period for the periodic-refresh protocol.
    pub cache_refresh_period_millis: u64,
    /// Per-operation RPC deadline.
    pub deadline_millis: u64,
    /// Optional durable client-side commit log path.
    pub log_filename: Option<String>,
    /// Flush the commit log synchronously on every commit.
    pub log_flush_on_commit: bool,
    /// Whether batched commits replace each transaction's dependency
    /// clock with an over-approximation sharing the last transaction's
    /// clock (spec.md §4.8 step 3).
    pub share_dependencies_in_batch: bool,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        ScoutConfig {
            server_hostnames: vec!["127.0.0.1:7777".to_string()],
            disaster_safe: false,
            concurrent_open_transactions: false,
            max_async_transactions_queued: 128,
            max_commit_batch_size: 32,
            cache_eviction_time_millis: 60_000,
            cache_size: 10_000,
            cache_update_protocol: CacheUpdateProtocol::CausalNotificationsStream,
            cache_refresh_period_millis: 1_000,
            deadline_millis: 5_000,
            log_filename: None,
            log_flush_on_commit: false,
            share_dependencies_in_batch: false,
        }
    }
}

impl ScoutConfig {
    pub fn validate(&self) -> ScoutResult<()> {
        if self.server_hostnames.is_empty() {
            return Err(ScoutError::IllegalState(
                "server_hostnames must not be empty".to_string(),
            ));
        }
        if self.max_commit_batch_size == 0 {
            return Err(ScoutError::IllegalState(
                "max_commit_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_async_transactions_queued == 0 {
            return Err(ScoutError::IllegalState(
                "max_async_transactions_queued must be greater than 0".to_string(),
            ));
        }
        if self.cache_size == 0 {
            return Err(ScoutError::IllegalState("cache_size must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn primary_hostname(&self) -> &str {
        &self.server_hostnames[0]
    }

    pub fn cache_eviction_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_eviction_time_millis)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_millis)
    }

    pub fn cache_refresh_period(&self) -> Duration {
        Duration::from_millis(self.cache_refresh_period_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ScoutConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_hostnames_is_invalid() {
        let mut cfg = ScoutConfig::default();
        cfg.server_hostnames.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let mut cfg = ScoutConfig::default();
        cfg.max_commit_batch_size = 0;
        assert!(cfg.validate().is_err());
    }
}
