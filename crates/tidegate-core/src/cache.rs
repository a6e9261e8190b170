//! TTL cache with transparent compression and key normalization.
//!
//! Values are serialized to JSON; payloads at or above the compression
//! threshold are stored gzip-compressed behind a one-byte marker prefix, so
//! reads always return the original structure regardless of how the payload
//! was stored. Keys longer than the configured maximum are deterministically
//! hashed into a `hash:` namespace so no physical key ever exceeds the limit.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::CacheError;

const RAW_MARKER: u8 = 0x00;
const COMPRESSED_MARKER: u8 = 0x01;

/// Reserved namespace for the self-test round trip; never visible to callers.
const PROBE_NAMESPACE: &str = "healthcheck";

/// Cache sizing and namespacing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without an explicit one.
    pub default_ttl: Duration,
    /// Physical keys never exceed this many bytes; longer logical keys are
    /// hashed. Must leave room for `"<prefix>:hash:"` plus a 64-char digest.
    pub max_key_length: usize,
    /// Serialized payloads at or above this many bytes are gzip-compressed.
    pub compress_threshold: usize,
    /// Namespace prepended to every physical key.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_key_length: 250,
            compress_threshold: 1024,
            key_prefix: String::from("tidegate"),
        }
    }
}

/// Counters reported by [`Cache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub compressed_writes: u64,
}

/// Result of the self-contained write/read/delete round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub round_trip: Duration,
    pub data_intact: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// Marker-prefixed payload: raw or gzip-compressed serialized JSON.
    payload: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Thread-safe TTL cache keyed by namespaced physical keys.
#[derive(Debug, Clone)]
pub struct Cache {
    config: Arc<CacheConfig>,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    compressed_writes: Arc<AtomicU64>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config: Arc::new(config),
            entries: Arc::new(RwLock::new(HashMap::new())),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            compressed_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read a value. Expired, absent, and undecodable entries all read as
    /// absent; decode failures are logged, never surfaced.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let physical = self.physical_key(key);
        let payload = {
            let entries = self.entries.read().await;
            match entries.get(&physical) {
                Some(entry) if !entry.is_expired(Instant::now()) => entry.payload.clone(),
                _ => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        match decode(&payload) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable cache entry");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write a value with the given TTL (default TTL when `None`). Returns
    /// `false` when the value cannot be serialized; storage itself cannot
    /// fail.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let payload = match self.encode(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key, error = %err, "cache write skipped, value not serializable");
                return false;
            }
        };

        let physical = self.physical_key(key);
        let expires_at = Instant::now() + ttl.unwrap_or(self.config.default_ttl);
        let mut entries = self.entries.write().await;
        entries.insert(physical, CacheEntry { payload, expires_at });
        true
    }

    pub async fn delete(&self, key: &str) -> bool {
        let physical = self.physical_key(key);
        let mut entries = self.entries.write().await;
        entries.remove(&physical).is_some()
    }

    pub async fn exists(&self, key: &str) -> bool {
        let physical = self.physical_key(key);
        let entries = self.entries.read().await;
        entries
            .get(&physical)
            .map(|entry| !entry.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    /// Remaining TTL, or `None` for absent/expired keys.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let physical = self.physical_key(key);
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.get(&physical).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.expires_at - now)
            }
        })
    }

    /// Refresh an existing entry's TTL. Returns `false` for absent/expired
    /// keys.
    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let physical = self.physical_key(key);
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(&physical) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    /// Atomically add `by` to the integer stored at `key`, treating an
    /// absent or expired key as zero. The existing expiry is preserved;
    /// fresh counters get the default TTL.
    pub async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let physical = self.physical_key(key);
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let (current, expires_at) = match entries.get(&physical) {
            Some(entry) if !entry.is_expired(now) => {
                let value: serde_json::Value = decode(&entry.payload)?;
                let current = value.as_i64().ok_or_else(|| CacheError::NotAnInteger {
                    key: key.to_string(),
                })?;
                (current, entry.expires_at)
            }
            _ => (0, now + self.config.default_ttl),
        };

        let next = current.saturating_add(by);
        let payload = self.encode(&next)?;
        entries.insert(physical, CacheEntry { payload, expires_at });
        Ok(next)
    }

    /// Batch read under a single lock acquisition. The result contains only
    /// keys that were present and fresh, mapped by their logical names.
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> HashMap<String, T> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut found = HashMap::new();

        for key in keys {
            let physical = self.physical_key(key);
            let Some(entry) = entries.get(&physical) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if entry.is_expired(now) {
                self.misses.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match decode(&entry.payload) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.to_string(), value);
                }
                Err(err) => {
                    warn!(key, error = %err, "discarding undecodable cache entry");
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        found
    }

    /// Batch write under a single lock acquisition. All values are encoded
    /// up front; any serialization failure skips the whole batch.
    pub async fn set_many<T: Serialize>(
        &self,
        values: &HashMap<String, T>,
        ttl: Option<Duration>,
    ) -> bool {
        let mut encoded = Vec::with_capacity(values.len());
        for (key, value) in values {
            match self.encode(value) {
                Ok(payload) => encoded.push((self.physical_key(key), payload)),
                Err(err) => {
                    warn!(key, error = %err, "batch cache write skipped");
                    return false;
                }
            }
        }

        let expires_at = Instant::now() + ttl.unwrap_or(self.config.default_ttl);
        let mut entries = self.entries.write().await;
        for (physical, payload) in encoded {
            entries.insert(physical, CacheEntry { payload, expires_at });
        }
        true
    }

    /// Remove every entry whose logical key matches the glob (`*` and `?`),
    /// returning the count removed. Hashed keys only match patterns that
    /// cover their `hash:` form.
    pub async fn flush_pattern(&self, pattern: &str) -> usize {
        let prefix = format!("{}:", self.config.key_prefix);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|physical, _| {
            let logical = physical.strip_prefix(&prefix).unwrap_or(physical);
            !glob_match(pattern, logical)
        });
        before - entries.len()
    }

    /// Drop entries past their expiry. The store also treats expired entries
    /// as absent on read; this just reclaims their memory.
    pub async fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len().await,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
        }
    }

    /// Self-contained write/read/delete round trip under a reserved probe
    /// key. Reports latency and byte-exact integrity without touching
    /// application keys.
    pub async fn health_check(&self) -> CacheHealth {
        let probe_key = format!("{PROBE_NAMESPACE}:probe");
        let probe_value = serde_json::json!({
            "probe": true,
            "stamp": fastrand::u64(..),
        });

        let started = Instant::now();
        let wrote = self.set(&probe_key, &probe_value, Some(Duration::from_secs(5))).await;
        let read_back: Option<serde_json::Value> = self.get(&probe_key).await;
        self.delete(&probe_key).await;
        let round_trip = started.elapsed();

        let data_intact = read_back.as_ref() == Some(&probe_value);
        if !wrote || !data_intact {
            warn!(wrote, data_intact, "cache health check failed");
        }

        CacheHealth {
            healthy: wrote && data_intact,
            round_trip,
            data_intact,
        }
    }

    /// Namespaced storage key. Long logical keys collapse to
    /// `<prefix>:hash:<sha256 hex>`, always under the length limit and always
    /// the same physical key for the same logical key.
    fn physical_key(&self, key: &str) -> String {
        let full = format!("{}:{}", self.config.key_prefix, key);
        if full.len() <= self.config.max_key_length {
            return full;
        }

        let digest = Sha256::digest(key.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }

        // trim the digest when even the hashed form would not fit
        let overhead = self.config.key_prefix.len() + ":hash:".len();
        let budget = self.config.max_key_length.saturating_sub(overhead).max(16);
        hex.truncate(budget);
        format!("{}:hash:{hex}", self.config.key_prefix)
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        let serialized = serde_json::to_vec(value)?;

        if serialized.len() >= self.config.compress_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            // Vec<u8> writes are infallible
            let _ = encoder.write_all(&serialized);
            if let Ok(compressed) = encoder.finish() {
                self.compressed_writes.fetch_add(1, Ordering::Relaxed);
                let mut payload = Vec::with_capacity(compressed.len() + 1);
                payload.push(COMPRESSED_MARKER);
                payload.extend_from_slice(&compressed);
                return Ok(payload);
            }
        }

        let mut payload = Vec::with_capacity(serialized.len() + 1);
        payload.push(RAW_MARKER);
        payload.extend_from_slice(&serialized);
        Ok(payload)
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CacheError> {
    match payload.split_first() {
        Some((&RAW_MARKER, rest)) => Ok(serde_json::from_slice(rest)?),
        Some((&COMPRESSED_MARKER, rest)) => {
            let mut decoder = GzDecoder::new(rest);
            let mut serialized = Vec::new();
            decoder
                .read_to_end(&mut serialized)
                .map_err(|err| CacheError::Decompression(err.to_string()))?;
            Ok(serde_json::from_slice(&serialized)?)
        }
        _ => Err(CacheError::Decompression(String::from(
            "missing payload marker",
        ))),
    }
}

/// Glob matcher supporting `*` (any run) and `?` (any single char).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // iterative matcher with single-star backtracking
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
