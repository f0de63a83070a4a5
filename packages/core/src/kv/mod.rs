//! Durable key-value adapter.
//!
//! The queue, dead-letter store and idempotency service all persist through
//! this trait. The contract is deliberately small: plain string keys with
//! optional TTL, one atomic primitive (`set_if_absent`), ordered sets for
//! time/priority indexes and hashes for job bodies. Nothing here assumes
//! server-side scripting.
//!
//! Two implementations ship with the core: [`MemoryKv`] for tests (with
//! expiry simulation driven by the injected clock) and [`RedisKv`] for the
//! networked backend.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryKv;
pub use self::redis::RedisKv;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set a string key, optionally expiring after `ttl_seconds`.
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;

    /// Get a string key. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key of any type.
    async fn del(&self, key: &str) -> Result<()>;

    /// Atomically set `key` to `value` with a TTL iff the key is absent.
    /// Returns true when this caller won the write.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool>;

    /// List keys matching a glob pattern (`*` wildcard).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Liveness check against the backend.
    async fn ping(&self) -> Result<()>;

    /// Atomically increment an integer key, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    // Ordered sets ------------------------------------------------------

    /// Add (or re-score) a member in an ordered set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove a member. Returns true when the member was present: the
    /// return value is the claim primitive the queue relies on: of several
    /// workers racing to remove the same member, exactly one sees true.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Number of members in an ordered set.
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Members with scores in `[min, max]`, ascending by score, at most
    /// `limit` when given. Ties order lexicographically by member.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>>;

    /// Score of a member, if present.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    // Hashes ------------------------------------------------------------

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Returns true when the field was present.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hlen(&self, key: &str) -> Result<u64>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;
}
