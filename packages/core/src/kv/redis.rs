//! Redis-backed KV implementation.
//!
//! Commands are issued explicitly so the mapping to the adapter contract is
//! auditable: `set_if_absent` is `SET NX EX`, ordered sets use
//! `ZADD`/`ZREM`/`ZRANGEBYSCORE`, hashes use the `H*` family. A
//! `ConnectionManager` handles reconnects; each call clones the manager,
//! which multiplexes over one underlying connection.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::Result;

use super::KvStore;

pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to a redis instance, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn bound(value: f64) -> String {
        if value <= f64::MIN {
            "-inf".to_string()
        } else if value >= f64::MAX {
            "+inf".to_string()
        } else {
            value.to_string()
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let mut con = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_seconds {
            cmd.arg("EX").arg(ttl);
        }
        let _: () = cmd.query_async(&mut con).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut con).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let mut con = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut con).await?;
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let mut con = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut con = self.manager.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut con = self.manager.clone();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut con).await?;
        Ok(count)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        let mut con = self.manager.clone();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key)
            .arg(Self::bound(min))
            .arg(Self::bound(max))
            .arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let members: Vec<(String, f64)> = cmd.query_async(&mut con).await?;
        Ok(members)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut con = self.manager.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(score)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut con)
            .await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut con)
            .await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let mut con = self.manager.clone();
        let count: u64 = redis::cmd("HLEN").arg(key).query_async(&mut con).await?;
        Ok(count)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut con = self.manager.clone();
        let pairs: Vec<(String, String)> =
            redis::cmd("HGETALL").arg(key).query_async(&mut con).await?;
        Ok(pairs)
    }
}
