//! In-memory KV implementation for tests.
//!
//! Expiry is simulated against the injected clock so tests using a manual
//! clock can step time past TTLs without sleeping. Expired string keys are
//! dropped lazily on access and swept on writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::common::Clock;
use crate::error::Result;

use super::KvStore;

struct StringEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    counters: HashMap<String, i64>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

pub struct MemoryKv {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn is_expired(entry: &StringEntry, now: DateTime<Utc>) -> bool {
        matches!(entry.expires_at, Some(at) if at <= now)
    }

    fn sweep(&self, inner: &mut Inner) {
        let now = self.clock.now();
        inner.strings.retain(|_, e| !Self::is_expired(e, now));
    }

    fn deadline(&self, ttl_seconds: Option<u64>) -> Option<DateTime<Utc>> {
        ttl_seconds.map(|s| self.clock.now() + ChronoDuration::seconds(s as i64))
    }
}

/// Minimal glob matcher supporting `*` wildcards, enough for the key
/// patterns the core issues (`prefix*`, `prefix*suffix`).
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut remainder = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == parts.len() - 1 && !pattern.ends_with('*') {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(pos) => remainder = &remainder[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: self.deadline(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        if let Some(entry) = inner.strings.get(key) {
            if Self::is_expired(entry, now) {
                inner.strings.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.counters.remove(key);
        inner.zsets.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let occupied = inner
            .strings
            .get(key)
            .map(|e| !Self::is_expired(e, now))
            .unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: self.deadline(Some(ttl_seconds)),
            },
        );
        Ok(true)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        let mut out: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.zsets.keys())
            .chain(inner.hashes.keys())
            .chain(inner.counters.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.zsets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        let inner = self.inner.lock();
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, &score)| score >= min && score <= max)
                    .map(|(m, &s)| (m.clone(), s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        if let Some(limit) = limit {
            members.truncate(limit);
        }
        Ok(members)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let inner = self.inner.lock();
        Ok(inner.zsets.get(key).and_then(|s| s.get(member).copied()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .hashes
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).map(|h| h.len() as u64).unwrap_or(0))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SystemClock;

    fn kv() -> MemoryKv {
        MemoryKv::new(Arc::new(SystemClock::new()))
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let kv = kv();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let kv = kv();
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_wins_once() {
        let kv = kv();
        assert!(kv.set_if_absent("lock", "1", 60).await.unwrap());
        assert!(!kv.set_if_absent("lock", "2", 60).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn del_clears_all_types() {
        let kv = kv();
        kv.set("k", "v", None).await.unwrap();
        kv.zadd("k", "m", 1.0).await.unwrap();
        kv.hset("k", "f", "v").await.unwrap();
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.zcard("k").await.unwrap(), 0);
        assert_eq!(kv.hlen("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zrem_claims_exactly_once() {
        let kv = kv();
        kv.zadd("q", "job-1", 5.0).await.unwrap();
        assert!(kv.zrem("q", "job-1").await.unwrap());
        assert!(!kv.zrem("q", "job-1").await.unwrap());
    }

    #[tokio::test]
    async fn zrange_orders_by_score_then_member() {
        let kv = kv();
        kv.zadd("q", "b", 2.0).await.unwrap();
        kv.zadd("q", "a", 1.0).await.unwrap();
        kv.zadd("q", "c", 1.0).await.unwrap();
        let all = kv
            .zrange_by_score("q", f64::MIN, f64::MAX, None)
            .await
            .unwrap();
        let members: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn zrange_respects_limit_and_bounds() {
        let kv = kv();
        for i in 0..5 {
            kv.zadd("q", &format!("m{i}"), i as f64).await.unwrap();
        }
        let due = kv.zrange_by_score("q", 0.0, 2.0, Some(2)).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].0, "m0");
    }

    #[tokio::test]
    async fn hash_roundtrip_and_len() {
        let kv = kv();
        kv.hset("h", "a", "1").await.unwrap();
        kv.hset("h", "b", "2").await.unwrap();
        assert_eq!(kv.hget("h", "a").await.unwrap(), Some("1".to_string()));
        assert_eq!(kv.hlen("h").await.unwrap(), 2);
        assert!(kv.hdel("h", "a").await.unwrap());
        assert!(!kv.hdel("h", "a").await.unwrap());
    }

    #[tokio::test]
    async fn keys_matches_glob() {
        let kv = kv();
        kv.set("aidos:idempotency:x", "1", None).await.unwrap();
        kv.set("aidos:tasks:waiting", "1", None).await.unwrap();
        let keys = kv.keys("aidos:idempotency:*").await.unwrap();
        assert_eq!(keys, vec!["aidos:idempotency:x".to_string()]);
    }

    #[tokio::test]
    async fn incr_counts_up() {
        let kv = kv();
        assert_eq!(kv.incr("seq").await.unwrap(), 1);
        assert_eq!(kv.incr("seq").await.unwrap(), 2);
    }

    #[test]
    fn glob_match_handles_middle_star() {
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*", "abc"));
        assert!(glob_match("*c", "abc"));
        assert!(!glob_match("a*d", "abc"));
        assert!(glob_match("abc", "abc"));
        assert!(!glob_match("abc", "abd"));
    }
}
