//! API response cache over the storage audit log
//!
//! Every upstream call is durably recorded (success or failure); `check`
//! serves the most recent successful record younger than the caller's TTL.
//! The TTL is supplied at read time, never stored, so tuning a TTL constant
//! retroactively changes hit eligibility for rows already on disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::storage::{NewApiCall, Storage};

/// A served cache hit
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub payload: Value,
    pub age_seconds: i64,
    pub record_id: i64,
}

pub struct CacheStore {
    storage: Arc<dyn Storage>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Deterministic hash of a parameter set, independent of insertion
    /// order. `serde_json` maps are keyed on a BTreeMap, so serializing the
    /// object is already canonical sorted-key JSON.
    pub fn params_hash(params: &Value) -> String {
        let canonical = params.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)
    }

    /// Look up a fresh successful response. Stale rows, failure-only rows
    /// and storage read errors all count as misses - a broken cache must
    /// never break the fetch path.
    pub async fn check(
        &self,
        provider: &str,
        function_name: &str,
        params: &Value,
        ttl: Duration,
    ) -> Option<CacheHit> {
        let hash = Self::params_hash(params);

        let record = match self
            .storage
            .latest_successful_call(provider, function_name, &hash)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!("Cache read failed for {}/{}: {}", provider, function_name, e);
                None
            }
        };

        if let Some(record) = record {
            let age_seconds = (Utc::now() - record.created_at).num_seconds().max(0);
            if age_seconds as u64 <= ttl.as_secs() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Cache HIT: {}/{} (age: {}s)",
                    provider, function_name, age_seconds
                );
                return Some(CacheHit {
                    payload: record.response_data,
                    age_seconds,
                    record_id: record.id,
                });
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Append an audit row for an upstream call. Write failures are logged
    /// and swallowed: callers proceed in uncached, unaudited mode rather
    /// than failing their primary operation.
    pub async fn save(
        &self,
        provider: &str,
        function_name: &str,
        params: &Value,
        response_data: &Value,
        success: bool,
        error_message: Option<&str>,
    ) -> Option<i64> {
        let hash = Self::params_hash(params);

        let call = NewApiCall {
            provider,
            function_name,
            parameters: params,
            parameters_hash: &hash,
            response_data,
            success,
            error_message,
            was_cached: false,
            cache_age_seconds: 0,
        };

        match self.storage.insert_api_call(&call).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    "Cache write failed for {}/{} (continuing uncached): {}",
                    provider, function_name, e
                );
                None
            }
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
