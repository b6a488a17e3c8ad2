use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::LimitConfigError;
use crate::persist;

// Rate limit entry - tracks attempts per action key
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    pub attempts: u32,
    /// Epoch milliseconds of the first attempt in the current window.
    pub window_start: i64,
}

/// Shared storage for limiter entries, keyed by action name.
pub trait RateLimitStore: Send + Sync {
    fn get(&self, key: &str) -> Option<RateLimitEntry>;
    fn set(&self, key: &str, entry: RateLimitEntry);
    fn reset(&self, key: &str);
}

/// Process-local store. Entries are lost on exit.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    fn set(&self, key: &str, entry: RateLimitEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    fn reset(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Store persisted to a JSON file so limits survive restarts.
pub struct FileRateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
    path: PathBuf,
}

impl FileRateLimitStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot: BTreeMap<String, RateLimitEntry> = persist::load(&path);
        debug!(path = %path.display(), entries = snapshot.len(), "rate limit state loaded");

        Self {
            entries: snapshot.into_iter().collect(),
            path,
        }
    }

    fn flush(&self) {
        let snapshot: BTreeMap<String, RateLimitEntry> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        if let Err(err) = persist::save(&self.path, &snapshot) {
            warn!(path = %self.path.display(), error = %err, "failed to persist rate limit state");
        }
    }
}

impl RateLimitStore for FileRateLimitStore {
    fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    fn set(&self, key: &str, entry: RateLimitEntry) {
        self.entries.insert(key.to_string(), entry);
        self.flush();
    }

    fn reset(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.flush();
        }
    }
}

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitConfig {
    max_attempts: u32,
    window_ms: u64,
}

impl LimitConfig {
    pub fn new(max_attempts: u32, window_ms: u64) -> Result<Self, LimitConfigError> {
        if max_attempts == 0 {
            return Err(LimitConfigError::ZeroAttempts);
        }
        if window_ms == 0 {
            return Err(LimitConfigError::ZeroWindow);
        }
        Ok(Self {
            max_attempts,
            window_ms,
        })
    }

    pub fn per_window(max_attempts: u32, window: Duration) -> Result<Self, LimitConfigError> {
        Self::new(max_attempts, window.as_millis() as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// Answer to "may I try again?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptStatus {
    pub allowed: bool,
    pub remaining_attempts: Option<u32>,
    /// Time left in the current window; absent when no window is open.
    pub remaining_ms: Option<u64>,
}

/// Counts attempts at one named action inside a fixed window.
///
/// The window opens on the first recorded attempt and restarts on the first
/// attempt after it lapses. Checking and recording are separate so callers can
/// record failures only and wipe the history after a success.
#[derive(Clone)]
pub struct AttemptLimiter {
    key: String,
    config: LimitConfig,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl AttemptLimiter {
    pub fn new(
        key: impl Into<String>,
        config: LimitConfig,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key: key.into(),
            config,
            store,
            clock,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> LimitConfig {
        self.config
    }

    pub fn can_attempt(&self) -> AttemptStatus {
        let now = self.clock.now_ms();

        let Some((entry, remaining_ms)) = self.active_entry(now) else {
            return AttemptStatus {
                allowed: true,
                remaining_attempts: Some(self.config.max_attempts),
                remaining_ms: None,
            };
        };

        if entry.attempts < self.config.max_attempts {
            AttemptStatus {
                allowed: true,
                remaining_attempts: Some(self.config.max_attempts - entry.attempts),
                remaining_ms: Some(remaining_ms),
            }
        } else {
            debug!(key = %self.key, attempts = entry.attempts, remaining_ms, "attempt limit reached");
            AttemptStatus {
                allowed: false,
                remaining_attempts: Some(0),
                remaining_ms: Some(remaining_ms),
            }
        }
    }

    /// Records one attempt. Does not enforce the limit.
    pub fn increment(&self) {
        let now = self.clock.now_ms();

        let entry = match self.active_entry(now) {
            Some((entry, _)) => RateLimitEntry {
                attempts: entry.attempts.saturating_add(1),
                window_start: entry.window_start,
            },
            None => RateLimitEntry {
                attempts: 1,
                window_start: now,
            },
        };

        debug!(key = %self.key, attempts = entry.attempts, "attempt recorded");
        self.store.set(&self.key, entry);
    }

    pub fn reset(&self) {
        self.store.reset(&self.key);
    }

    // Current entry and the time until its window closes; expired entries are dropped
    fn active_entry(&self, now: i64) -> Option<(RateLimitEntry, u64)> {
        let entry = self.store.get(&self.key)?;
        // Signed: a window start ahead of the clock stays open until start + window
        let elapsed = i128::from(now) - i128::from(entry.window_start);
        let remaining_ms = i128::from(self.config.window_ms) - elapsed;

        if remaining_ms <= 0 {
            self.store.reset(&self.key);
            return None;
        }
        Some((entry, u64::try_from(remaining_ms).unwrap_or(u64::MAX)))
    }
}
