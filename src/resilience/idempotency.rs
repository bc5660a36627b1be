//! TTL-bounded cache of operation results keyed by operation + parameters.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord<T> {
    pub operation_key: String,
    pub result: T,
    pub executed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`IdempotencyGuard::check_and_store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyCheck<T> {
    /// An identical operation was already stored within the TTL.
    pub is_duplicate: bool,
    /// The originally stored result when `is_duplicate` is true.
    pub cached_result: Option<T>,
}

/// Remembers results so identical operations execute at most once per TTL.
///
/// Every access first drops expired entries. All state sits behind one
/// mutex, so concurrent identical calls resolve to a single winner.
#[derive(Debug)]
pub struct IdempotencyGuard<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, IdempotencyRecord<T>>>,
}

impl<T: Clone> IdempotencyGuard<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Hex SHA-256 of the operation name and the canonical form of `params`.
    /// Object key order in `params` does not affect the key.
    pub fn operation_key(operation: &str, params: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_json(params).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Store `result` unless an identical operation is already cached.
    ///
    /// Returns `is_duplicate = false` to exactly one caller per key and TTL
    /// window; everyone else receives the stored result and must not repeat
    /// the side effects.
    pub fn check_and_store(&self, operation: &str, params: &Value, result: T) -> IdempotencyCheck<T> {
        let key = Self::operation_key(operation, params);
        let now = Utc::now();
        let mut entries = self.lock_and_purge(now);

        if let Some(existing) = entries.get(&key) {
            debug!(operation, key = %key, "duplicate operation");
            return IdempotencyCheck {
                is_duplicate: true,
                cached_result: Some(existing.result.clone()),
            };
        }

        let expires_at = TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        entries.insert(
            key.clone(),
            IdempotencyRecord {
                operation_key: key,
                result,
                executed_at: now,
                expires_at,
            },
        );
        IdempotencyCheck {
            is_duplicate: false,
            cached_result: None,
        }
    }

    /// Cached result for an operation, if one is live.
    pub fn lookup(&self, operation: &str, params: &Value) -> Option<T> {
        let key = Self::operation_key(operation, params);
        self.lock_and_purge(Utc::now())
            .get(&key)
            .map(|record| record.result.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock_and_purge(Utc::now()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_and_purge(&self, now: DateTime<Utc>) -> MutexGuard<'_, HashMap<String, IdempotencyRecord<T>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, record| record.expires_at > now);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "expired idempotency entries dropped");
        }
        entries
    }
}

/// JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
