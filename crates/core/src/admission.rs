//! Duplicate-submission guard.
//!
//! A request is admitted when its [`Fingerprint`] is not already marked
//! within the dedup window. Marking is a single set-if-absent call against a
//! [`DedupStore`], so two concurrent submissions of the same request can
//! never both be admitted.
//!
//! What happens when the store itself is unreachable is an explicit
//! [`StoreFailurePolicy`] on [`AdmissionConfig`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{BoundedCache, CacheConfig};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::hashing::{sha256_fields, sha256_hex};

/// Default dedup window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Default capacity of the in-memory dedup store.
pub const DEFAULT_DEDUP_MAX_ENTRIES: usize = 10_000;

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Identity key of a request, used only to detect duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive a fingerprint from who sent the request, where it is aimed,
    /// and what it contains.
    pub fn derive(caller: &str, target: &str, content: &[u8]) -> Self {
        let content_hash = sha256_hex(content);
        Self(sha256_fields(&[
            caller.as_bytes(),
            target.as_bytes(),
            content_hash.as_bytes(),
        ]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Store seam
// ---------------------------------------------------------------------------

/// Backing store for admission marks.
///
/// Shared-store implementations (e.g. a distributed cache) must make
/// `set_if_absent` atomic on the server side.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Mark `key` for `ttl` if it is not already marked.
    ///
    /// Returns `Ok(true)` when this call created the mark.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CoreError>;

    /// Clear a mark early. Returns `Ok(true)` if a live mark was removed.
    async fn remove(&self, key: &str) -> Result<bool, CoreError>;
}

/// Process-local [`DedupStore`] backed by a [`BoundedCache`].
pub struct InMemoryDedupStore {
    cache: Arc<BoundedCache<()>>,
}

impl InMemoryDedupStore {
    pub fn new(cache: Arc<BoundedCache<()>>) -> Self {
        Self { cache }
    }

    /// Build a store with its own cache of `max_entries` marks.
    pub fn with_capacity(max_entries: usize, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let config = CacheConfig {
            ttl: DEFAULT_DEDUP_WINDOW,
            max_size: max_entries,
        };
        Ok(Self::new(Arc::new(BoundedCache::with_clock(config, clock)?)))
    }

    pub fn cache(&self) -> &Arc<BoundedCache<()>> {
        &self.cache
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CoreError> {
        Ok(self.cache.set_if_absent(key, (), ttl))
    }

    async fn remove(&self, key: &str) -> Result<bool, CoreError> {
        Ok(self.cache.delete(key))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Behaviour when the [`DedupStore`] returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Admit the request and log a warning.
    FailOpen,
    /// Reject the request with [`CoreError::StoreUnavailable`].
    FailClosed,
}

impl StoreFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailOpen => "fail_open",
            Self::FailClosed => "fail_closed",
        }
    }
}

impl FromStr for StoreFailurePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fail_open" => Ok(Self::FailOpen),
            "fail_closed" => Ok(Self::FailClosed),
            other => Err(CoreError::Configuration(format!(
                "Invalid store failure policy '{other}'. Must be one of: fail_open, fail_closed"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// How long a fingerprint stays marked after admission.
    pub window: Duration,
    pub on_store_failure: StoreFailurePolicy,
}

impl AdmissionConfig {
    /// Default window with the given failure policy.
    pub fn new(on_store_failure: StoreFailurePolicy) -> Self {
        Self {
            window: DEFAULT_DEDUP_WINDOW,
            on_store_failure,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.window.is_zero() {
            return Err(CoreError::Configuration(
                "dedup window must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Grants at most one admission per fingerprint per window.
pub struct AdmissionGuard {
    store: Arc<dyn DedupStore>,
    config: AdmissionConfig,
}

impl fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionGuard {
    pub fn new(store: Arc<dyn DedupStore>, config: AdmissionConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> AdmissionConfig {
        self.config
    }

    /// Returns `Ok(true)` if `fingerprint` was already admitted within the
    /// window, otherwise marks it and returns `Ok(false)`.
    ///
    /// Store errors are resolved by the configured [`StoreFailurePolicy`].
    pub async fn is_duplicate(&self, fingerprint: &Fingerprint) -> Result<bool, CoreError> {
        match self
            .store
            .set_if_absent(fingerprint.as_str(), self.config.window)
            .await
        {
            Ok(true) => Ok(false),
            Ok(false) => {
                tracing::debug!(fingerprint = %fingerprint, "Duplicate submission rejected");
                Ok(true)
            }
            Err(e) => match self.config.on_store_failure {
                StoreFailurePolicy::FailOpen => {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        error = %e,
                        "Dedup store unavailable, admitting request (fail open)",
                    );
                    Ok(false)
                }
                StoreFailurePolicy::FailClosed => {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        error = %e,
                        "Dedup store unavailable, rejecting request (fail closed)",
                    );
                    Err(as_unavailable(e))
                }
            },
        }
    }

    /// Forget an admission before its window elapses.
    ///
    /// Used when a job could not be submitted, so the caller can retry
    /// immediately.
    pub async fn release(&self, fingerprint: &Fingerprint) -> Result<bool, CoreError> {
        self.store
            .remove(fingerprint.as_str())
            .await
            .map_err(as_unavailable)
    }
}

/// Report any store error as `StoreUnavailable`, without re-wrapping one
/// that already is.
fn as_unavailable(err: CoreError) -> CoreError {
    match err {
        CoreError::StoreUnavailable(_) => err,
        other => CoreError::StoreUnavailable(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
