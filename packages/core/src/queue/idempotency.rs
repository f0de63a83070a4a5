//! Content-keyed idempotent execution.
//!
//! A successful execution of `(task_name, payload)` is cached under a key
//! derived from the task name and a canonical hash of the payload. A
//! companion `:lock` key, acquired with `set_if_absent`, guarantees a single
//! executor across concurrent attempts: the losers wait with bounded
//! exponential backoff for the winner's result and fall out with
//! `IdempotencyBusy` if it never appears.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::common::{payload_hash, Clock};
use crate::error::{CoreError, Result};
use crate::kv::KvStore;

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub key_prefix: String,
    /// How long cached results live. Default 7 days.
    pub ttl_seconds: u64,
    /// TTL on the execution lock; bounds the damage of a crashed executor.
    pub lock_ttl_seconds: u64,
    /// First wait when the lock is contended; doubles per round.
    pub lock_initial_wait: Duration,
    /// Total time a contended caller will wait before giving up.
    pub lock_wait_budget: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            key_prefix: "aidos:idempotency:".to_string(),
            ttl_seconds: 604_800,
            lock_ttl_seconds: 300,
            lock_initial_wait: Duration::from_millis(100),
            lock_wait_budget: Duration::from_secs(10),
        }
    }
}

/// Cached record of a successful execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub result: Value,
    pub executed_at: DateTime<Utc>,
}

/// Result of an idempotent call: the value plus whether it was served from
/// cache.
#[derive(Debug, Clone)]
pub struct IdempotentOutcome {
    pub result: Value,
    pub is_cached: bool,
}

pub struct IdempotencyService {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: IdempotencyConfig) -> Self {
        Self { kv, clock, config }
    }

    /// Key for `(task_name, payload)`: object keys are sorted before
    /// hashing, so structurally equal payloads share a key.
    pub fn key_for(&self, task_name: &str, payload: &Value) -> String {
        format!(
            "{}{}:{}",
            self.config.key_prefix,
            task_name,
            payload_hash(payload)
        )
    }

    fn lock_key(key: &str) -> String {
        format!("{key}:lock")
    }

    /// Look up a cached result by key.
    pub async fn check(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        match self.kv.get(key).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Execute `executor` at most once per `(task_name, payload)`.
    ///
    /// Both of two concurrent callers receive the same result; exactly one
    /// runs the executor. Executor failures are not cached: the next call
    /// runs fresh.
    pub async fn execute_idempotent<F, Fut>(
        &self,
        task_name: &str,
        payload: &Value,
        executor: F,
    ) -> Result<IdempotentOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        let key = self.key_for(task_name, payload);
        let lock_key = Self::lock_key(&key);

        if let Some(record) = self.check(&key).await? {
            debug!(key = %key, "idempotency cache hit");
            return Ok(IdempotentOutcome {
                result: record.result,
                is_cached: true,
            });
        }

        // Contend for the lock with bounded exponential waits. A loser
        // usually finds the winner's result during this loop.
        let mut waited = Duration::ZERO;
        let mut wait = self.config.lock_initial_wait;
        let acquired = loop {
            if self
                .kv
                .set_if_absent(&lock_key, "1", self.config.lock_ttl_seconds)
                .await?
            {
                break true;
            }
            if waited >= self.config.lock_wait_budget {
                break false;
            }
            tokio::time::sleep(wait).await;
            waited += wait;
            wait = (wait * 2).min(Duration::from_secs(2));

            if let Some(record) = self.check(&key).await? {
                return Ok(IdempotentOutcome {
                    result: record.result,
                    is_cached: true,
                });
            }
        };

        if !acquired {
            // One final look before giving up; the winner may have just
            // published.
            if let Some(record) = self.check(&key).await? {
                return Ok(IdempotentOutcome {
                    result: record.result,
                    is_cached: true,
                });
            }
            return Err(CoreError::IdempotencyBusy);
        }

        // Holding the lock. Re-check: we may have acquired it after the
        // previous holder published and its lock expired.
        if let Some(record) = self.check(&key).await? {
            self.kv.del(&lock_key).await?;
            return Ok(IdempotentOutcome {
                result: record.result,
                is_cached: true,
            });
        }

        let outcome = executor().await;
        match outcome {
            Ok(result) => {
                let record = IdempotencyRecord {
                    result: result.clone(),
                    executed_at: self.clock.now(),
                };
                let body = serde_json::to_string(&record)?;
                self.kv
                    .set(&key, &body, Some(self.config.ttl_seconds))
                    .await?;
                self.kv.del(&lock_key).await?;
                Ok(IdempotentOutcome {
                    result,
                    is_cached: false,
                })
            }
            Err(error) => {
                self.kv.del(&lock_key).await?;
                Err(error)
            }
        }
    }

    /// Drop a cached record and its lock.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.kv.del(key).await?;
        self.kv.del(&Self::lock_key(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SystemClock;
    use crate::kv::MemoryKv;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service() -> Arc<IdempotencyService> {
        let clock = Arc::new(SystemClock::new());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(clock.clone()));
        Arc::new(IdempotencyService::new(
            kv,
            clock,
            IdempotencyConfig::default(),
        ))
    }

    #[test]
    fn key_is_stable_across_key_order() {
        let service = service();
        let a = service.key_for("addUser", &json!({"name": "a", "age": 30}));
        let b = service.key_for("addUser", &json!({"age": 30, "name": "a"}));
        assert_eq!(a, b);
        assert!(a.starts_with("aidos:idempotency:addUser:"));
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let service = service();
        let calls = Arc::new(AtomicU32::new(0));

        for expect_cached in [false, true] {
            let calls = calls.clone();
            let outcome = service
                .execute_idempotent("addUser", &json!({"name": "a"}), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"id": "u1"}))
                })
                .await
                .unwrap();
            assert_eq!(outcome.is_cached, expect_cached);
            assert_eq!(outcome.result, json!({"id": "u1"}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_calls_invoke_executor_once() {
        let service = service();
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            {
                let service = service.clone();
                let calls = calls.clone();
                async move {
                    service
                        .execute_idempotent("addUser", &json!({"name": "a", "age": 30}), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(json!({"id": "u1"}))
                        })
                        .await
                }
            },
            {
                let service = service.clone();
                let calls = calls.clone();
                async move {
                    service
                        .execute_idempotent("addUser", &json!({"age": 30, "name": "a"}), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(json!({"id": "u1"}))
                        })
                        .await
                }
            }
        );

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.result, json!({"id": "u1"}));
        assert_eq!(b.result, json!({"id": "u1"}));
        // Exactly one of the two saw the cache.
        assert!(a.is_cached != b.is_cached);
    }

    #[tokio::test]
    async fn failed_execution_is_not_cached() {
        let service = service();
        let calls = Arc::new(AtomicU32::new(0));

        let first = {
            let calls = calls.clone();
            service
                .execute_idempotent("job", &json!({}), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::execution("ECONNREFUSED"))
                })
                .await
        };
        assert!(first.is_err());

        let second = {
            let calls = calls.clone();
            service
                .execute_idempotent("job", &json!({}), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"ok": true}))
                })
                .await
                .unwrap()
        };
        assert!(!second.is_cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn contended_lock_without_result_reports_busy() {
        let clock = Arc::new(SystemClock::new());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(clock.clone()));
        let service = IdempotencyService::new(
            kv.clone(),
            clock,
            IdempotencyConfig {
                lock_initial_wait: Duration::from_millis(5),
                lock_wait_budget: Duration::from_millis(30),
                ..Default::default()
            },
        );

        // Simulate a holder that never publishes a result.
        let key = service.key_for("stuck", &json!({}));
        kv.set_if_absent(&format!("{key}:lock"), "1", 300)
            .await
            .unwrap();

        let err = service
            .execute_idempotent("stuck", &json!({}), || async move { Ok(json!({})) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::IdempotencyBusy));
    }

    #[tokio::test]
    async fn invalidate_clears_record_and_lock() {
        let service = service();
        service
            .execute_idempotent("job", &json!({"n": 1}), || async move { Ok(json!(1)) })
            .await
            .unwrap();

        let key = service.key_for("job", &json!({"n": 1}));
        service.invalidate(&key).await.unwrap();
        assert!(service.check(&key).await.unwrap().is_none());

        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let outcome = service
            .execute_idempotent("job", &json!({"n": 1}), || async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json!(2))
            })
            .await
            .unwrap();
        assert!(!outcome.is_cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
