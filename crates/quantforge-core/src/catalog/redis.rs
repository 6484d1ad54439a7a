//! Redis-backed catalog.
//!
//! Entries live as JSON strings in a hash; the converting and failed sets
//! and the quant-progress cursor are plain sets and a hash alongside it.
//! Single-entry writes use optimistic concurrency (`WATCH`/`MULTI`/`EXEC`)
//! so multiple orchestrator processes can share one catalog.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::{
    plan_field_update, CatalogStore, ImportSummary, ModelEntry, UpdatePlan, CONVERTING_KEY,
    FAILED_KEY, PROGRESS_KEY, REGISTRY_KEY,
};
use crate::config::RedisSettings;
use crate::error::{ForgeError, Result};

/// Transient-failure retry budget per operation.
const OP_RETRIES: u32 = 3;
/// Optimistic-concurrency conflict budget per write.
const CAS_ATTEMPTS: u32 = 8;

/// Redis-backed [`CatalogStore`] implementation.
pub struct RedisCatalog {
    client: redis::Client,
}

impl RedisCatalog {
    /// Open a client against the configured server. No connection is made
    /// until the first operation; use [`ping`](Self::ping) to verify.
    pub fn new(settings: &RedisSettings) -> Result<Self> {
        let client = redis::Client::open(settings.url())?;
        Ok(Self { client })
    }

    /// Round-trip a PING to verify connectivity and credentials.
    pub async fn ping(&self) -> Result<()> {
        let mut con = self.connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::Connection> {
        Ok(self.client.get_async_connection().await?)
    }

    /// Run an operation with a bounded retry on transient store errors,
    /// backing off linearly between attempts.
    async fn retrying<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < OP_RETRIES => {
                    attempt += 1;
                    warn!("Catalog operation failed (attempt {attempt}/{OP_RETRIES}): {e}");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_get(&self, key: &str) -> Result<Option<ModelEntry>> {
        let mut con = self.connection().await?;
        let raw: Option<String> = con.hget(REGISTRY_KEY, key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn try_put_if_absent(&self, key: &str, entry: &ModelEntry) -> Result<bool> {
        let json = serde_json::to_string(entry)?;
        let mut con = self.connection().await?;
        for _ in 0..CAS_ATTEMPTS {
            redis::cmd("WATCH")
                .arg(REGISTRY_KEY)
                .query_async::<_, ()>(&mut con)
                .await?;
            let exists: bool = con.hexists(REGISTRY_KEY, key).await?;
            if exists {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut con).await?;
                return Ok(false);
            }
            let committed: Option<()> = redis::pipe()
                .atomic()
                .hset(REGISTRY_KEY, key, &json)
                .ignore()
                .query_async(&mut con)
                .await?;
            if committed.is_some() {
                return Ok(true);
            }
            // Another writer touched the registry; observe again.
        }
        Err(conflict_exhausted(key))
    }

    async fn try_update_field(
        &self,
        key: &str,
        field: &str,
        value: &Value,
        condition: Option<&serde_json::Map<String, Value>>,
    ) -> Result<bool> {
        let mut con = self.connection().await?;
        for _ in 0..CAS_ATTEMPTS {
            redis::cmd("WATCH")
                .arg(REGISTRY_KEY)
                .query_async::<_, ()>(&mut con)
                .await?;
            let raw: Option<String> = con.hget(REGISTRY_KEY, key).await?;
            let Some(json) = raw else {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut con).await?;
                debug!("update_field: {key} not found");
                return Ok(false);
            };
            let entry: Value = serde_json::from_str(&json)?;

            match plan_field_update(&entry, field, value, condition) {
                UpdatePlan::NoOp => {
                    redis::cmd("UNWATCH").query_async::<_, ()>(&mut con).await?;
                    debug!("update_field: {key}.{field} already holds the desired value");
                    return Ok(true);
                }
                UpdatePlan::ConditionFailed => {
                    redis::cmd("UNWATCH").query_async::<_, ()>(&mut con).await?;
                    debug!("update_field: precondition failed for {key}.{field}");
                    return Ok(false);
                }
                UpdatePlan::Write(updated) => {
                    let updated_json = serde_json::to_string(&updated)?;
                    let committed: Option<()> = redis::pipe()
                        .atomic()
                        .hset(REGISTRY_KEY, key, &updated_json)
                        .ignore()
                        .query_async(&mut con)
                        .await?;
                    if committed.is_some() {
                        return Ok(true);
                    }
                }
            }
        }
        Err(conflict_exhausted(key))
    }

    async fn try_all(&self) -> Result<BTreeMap<String, ModelEntry>> {
        let mut con = self.connection().await?;
        let raw: BTreeMap<String, String> = con.hgetall(REGISTRY_KEY).await?;
        let mut snapshot = BTreeMap::new();
        for (key, json) in raw {
            snapshot.insert(key, serde_json::from_str(&json)?);
        }
        Ok(snapshot)
    }

    async fn try_import_many(
        &self,
        keys: &[String],
        defaults: &ModelEntry,
    ) -> Result<ImportSummary> {
        let default_json = serde_json::to_string(defaults)?;
        let mut con = self.connection().await?;
        for _ in 0..CAS_ATTEMPTS {
            redis::cmd("WATCH")
                .arg(REGISTRY_KEY)
                .query_async::<_, ()>(&mut con)
                .await?;
            let mut registry: BTreeMap<String, String> = con.hgetall(REGISTRY_KEY).await?;

            let mut summary = ImportSummary::default();
            for key in keys {
                match registry.get(key) {
                    Some(json) => {
                        let mut entry: Value = serde_json::from_str(json)?;
                        let converted = entry
                            .get("converted")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if !converted {
                            if let Some(obj) = entry.as_object_mut() {
                                obj.insert("converted".to_string(), Value::Bool(true));
                            }
                            registry.insert(key.clone(), serde_json::to_string(&entry)?);
                            summary.updated += 1;
                        }
                    }
                    None => {
                        registry.insert(key.clone(), default_json.clone());
                        summary.added += 1;
                    }
                }
            }

            // One transactional replace of the registry.
            let mut pipe = redis::pipe();
            pipe.atomic().del(REGISTRY_KEY).ignore();
            for (key, json) in &registry {
                pipe.hset(REGISTRY_KEY, key, json).ignore();
            }
            let committed: Option<()> = pipe.query_async(&mut con).await?;
            if committed.is_some() {
                return Ok(summary);
            }
        }
        Err(conflict_exhausted("import_many"))
    }
}

fn conflict_exhausted(what: &str) -> ForgeError {
    ForgeError::Catalog {
        message: format!("optimistic update for {what} kept conflicting after {CAS_ATTEMPTS} attempts"),
        source: None,
    }
}

#[async_trait::async_trait]
impl CatalogStore for RedisCatalog {
    async fn get(&self, key: &str) -> Result<Option<ModelEntry>> {
        self.retrying(|| self.try_get(key)).await
    }

    async fn put_if_absent(&self, key: &str, entry: &ModelEntry) -> Result<bool> {
        self.retrying(|| self.try_put_if_absent(key, entry)).await
    }

    async fn update_field(
        &self,
        key: &str,
        field: &str,
        value: Value,
        condition: Option<&serde_json::Map<String, Value>>,
    ) -> Result<bool> {
        self.retrying(|| self.try_update_field(key, field, &value, condition))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            let removed: i64 = con.hdel(REGISTRY_KEY, key).await?;
            Ok(removed == 1)
        })
        .await
    }

    async fn all(&self) -> Result<BTreeMap<String, ModelEntry>> {
        self.retrying(|| self.try_all()).await
    }

    async fn import_many(&self, keys: &[String], defaults: &ModelEntry) -> Result<ImportSummary> {
        self.retrying(|| self.try_import_many(keys, defaults)).await
    }

    async fn backup(&self, path: &Path) -> Result<()> {
        // Typed entries serialize with a fixed field order, so a
        // backup → restore → backup cycle is byte-stable.
        let snapshot = self.try_all().await?;
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| ForgeError::io_with_path(e, path))?;
        Ok(())
    }

    async fn restore(&self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ForgeError::io_with_path(e, path))?;
        let parsed: BTreeMap<String, Value> = serde_json::from_str(&raw)?;

        let mut con = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(REGISTRY_KEY).ignore();
        for (key, entry) in &parsed {
            pipe.hset(REGISTRY_KEY, key, serde_json::to_string(entry)?)
                .ignore();
        }
        let _: Option<()> = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn mark_converting(&self, key: &str) -> Result<bool> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            let added: i64 = con.sadd(CONVERTING_KEY, key).await?;
            Ok(added == 1)
        })
        .await
    }

    async fn unmark_converting(&self, key: &str) -> Result<()> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            con.srem::<_, _, ()>(CONVERTING_KEY, key).await?;
            Ok(())
        })
        .await
    }

    async fn converting_members(&self) -> Result<Vec<String>> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            Ok(con.smembers(CONVERTING_KEY).await?)
        })
        .await
    }

    async fn is_converting(&self, key: &str) -> Result<bool> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            Ok(con.sismember(CONVERTING_KEY, key).await?)
        })
        .await
    }

    async fn mark_failed(&self, key: &str) -> Result<()> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            con.sadd::<_, _, ()>(FAILED_KEY, key).await?;
            Ok(())
        })
        .await
    }

    async fn unmark_failed(&self, key: &str) -> Result<()> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            con.srem::<_, _, ()>(FAILED_KEY, key).await?;
            Ok(())
        })
        .await
    }

    async fn is_failed(&self, key: &str) -> Result<bool> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            Ok(con.sismember(FAILED_KEY, key).await?)
        })
        .await
    }

    async fn set_quant_progress(&self, key: &str, quant_id: &str) -> Result<()> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            con.hset::<_, _, _, ()>(PROGRESS_KEY, key, quant_id).await?;
            Ok(())
        })
        .await
    }

    async fn get_quant_progress(&self, key: &str) -> Result<Option<String>> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            Ok(con.hget(PROGRESS_KEY, key).await?)
        })
        .await
    }

    async fn clear_quant_progress(&self, key: &str) -> Result<()> {
        self.retrying(|| async {
            let mut con = self.connection().await?;
            con.hdel::<_, _, ()>(PROGRESS_KEY, key).await?;
            Ok(())
        })
        .await
    }
}
