//! In-memory catalog backend.
//!
//! Same observable semantics as the redis backend, held in process memory.
//! Used by tests and offline tools that operate on a backup file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::RwLock;

use serde_json::Value;

use super::traits::{
    plan_field_update, CatalogStore, ImportSummary, ModelEntry, UpdatePlan,
};
use crate::error::{ForgeError, Result};

#[derive(Default)]
struct Inner {
    registry: BTreeMap<String, Value>,
    converting: BTreeSet<String>,
    failed: BTreeSet<String>,
    progress: HashMap<String, String>,
}

/// In-memory [`CatalogStore`] implementation.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn decode(key: &str, value: &Value) -> Result<ModelEntry> {
    serde_json::from_value(value.clone()).map_err(|e| ForgeError::Catalog {
        message: format!("corrupt catalog entry for {key}: {e}"),
        source: None,
    })
}

#[async_trait::async_trait]
impl CatalogStore for MemoryCatalog {
    async fn get(&self, key: &str) -> Result<Option<ModelEntry>> {
        let inner = self.inner.read().unwrap();
        match inner.registry.get(key) {
            Some(value) => Ok(Some(decode(key, value)?)),
            None => Ok(None),
        }
    }

    async fn put_if_absent(&self, key: &str, entry: &ModelEntry) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        if inner.registry.contains_key(key) {
            return Ok(false);
        }
        inner
            .registry
            .insert(key.to_string(), serde_json::to_value(entry)?);
        Ok(true)
    }

    async fn update_field(
        &self,
        key: &str,
        field: &str,
        value: Value,
        condition: Option<&serde_json::Map<String, Value>>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let Some(current) = inner.registry.get(key) else {
            return Ok(false);
        };
        match plan_field_update(current, field, &value, condition) {
            UpdatePlan::NoOp => Ok(true),
            UpdatePlan::ConditionFailed => Ok(false),
            UpdatePlan::Write(updated) => {
                inner.registry.insert(key.to_string(), updated);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner.registry.remove(key).is_some())
    }

    async fn all(&self) -> Result<BTreeMap<String, ModelEntry>> {
        let inner = self.inner.read().unwrap();
        let mut snapshot = BTreeMap::new();
        for (key, value) in &inner.registry {
            snapshot.insert(key.clone(), decode(key, value)?);
        }
        Ok(snapshot)
    }

    async fn import_many(&self, keys: &[String], defaults: &ModelEntry) -> Result<ImportSummary> {
        let default_value = serde_json::to_value(defaults)?;
        let mut inner = self.inner.write().unwrap();
        let mut summary = ImportSummary::default();
        for key in keys {
            match inner.registry.get_mut(key) {
                Some(existing) => {
                    let converted = existing
                        .get("converted")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if !converted {
                        if let Some(obj) = existing.as_object_mut() {
                            obj.insert("converted".to_string(), Value::Bool(true));
                        }
                        summary.updated += 1;
                    }
                }
                None => {
                    inner.registry.insert(key.clone(), default_value.clone());
                    summary.added += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn backup(&self, path: &Path) -> Result<()> {
        let snapshot: BTreeMap<String, Value> = {
            let inner = self.inner.read().unwrap();
            inner.registry.clone()
        };
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
        let mut inner = self.inner.write().unwrap();
        inner.registry = parsed;
        Ok(())
    }

    async fn mark_converting(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner.converting.insert(key.to_string()))
    }

    async fn unmark_converting(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.converting.remove(key);
        Ok(())
    }

    async fn converting_members(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.converting.iter().cloned().collect())
    }

    async fn is_converting(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.converting.contains(key))
    }

    async fn mark_failed(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.failed.insert(key.to_string());
        Ok(())
    }

    async fn unmark_failed(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.failed.remove(key);
        Ok(())
    }

    async fn is_failed(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.failed.contains(key))
    }

    async fn set_quant_progress(&self, key: &str, quant_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.progress.insert(key.to_string(), quant_id.to_string());
        Ok(())
    }

    async fn get_quant_progress(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.progress.get(key).cloned())
    }

    async fn clear_quant_progress(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.progress.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> ModelEntry {
        ModelEntry::new(1_000_000_000, true, false)
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.put_if_absent("org/model", &entry()).await.unwrap());
        assert!(!catalog.put_if_absent("org/model", &entry()).await.unwrap());
        assert!(catalog.get("org/model").await.unwrap().is_some());
        assert!(catalog.get("other/model").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_field_basic() {
        let catalog = MemoryCatalog::new();
        catalog.put_if_absent("org/model", &entry()).await.unwrap();

        assert!(catalog
            .update_field("org/model", "attempts", json!(1), None)
            .await
            .unwrap());
        assert_eq!(catalog.get("org/model").await.unwrap().unwrap().attempts, 1);

        // Missing entry fails.
        assert!(!catalog
            .update_field("ghost/model", "attempts", json!(1), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_update_field_equal_value_is_noop_success() {
        let catalog = MemoryCatalog::new();
        catalog.put_if_absent("org/model", &entry()).await.unwrap();

        // Stored as bool false; the truthy-string form compares equal.
        assert!(catalog
            .update_field("org/model", "converted", json!("false"), None)
            .await
            .unwrap());
        assert!(!catalog.get("org/model").await.unwrap().unwrap().converted);
    }

    #[tokio::test]
    async fn test_update_field_precondition() {
        let catalog = MemoryCatalog::new();
        catalog.put_if_absent("org/model", &entry()).await.unwrap();

        let mut good = serde_json::Map::new();
        good.insert("converted".to_string(), json!("false"));
        assert!(catalog
            .update_field("org/model", "attempts", json!(2), Some(&good))
            .await
            .unwrap());

        let mut bad = serde_json::Map::new();
        bad.insert("converted".to_string(), json!(true));
        assert!(!catalog
            .update_field("org/model", "attempts", json!(5), Some(&bad))
            .await
            .unwrap());
        assert_eq!(catalog.get("org/model").await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_converting_and_failed_sets() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.mark_converting("org/model").await.unwrap());
        assert!(!catalog.mark_converting("org/model").await.unwrap());
        assert!(catalog.is_converting("org/model").await.unwrap());
        assert_eq!(
            catalog.converting_members().await.unwrap(),
            vec!["org/model".to_string()]
        );

        catalog.mark_failed("org/model").await.unwrap();
        assert!(catalog.is_failed("org/model").await.unwrap());
        catalog.unmark_failed("org/model").await.unwrap();
        assert!(!catalog.is_failed("org/model").await.unwrap());

        catalog.unmark_converting("org/model").await.unwrap();
        assert!(!catalog.is_converting("org/model").await.unwrap());
    }

    #[tokio::test]
    async fn test_quant_progress_roundtrip() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.get_quant_progress("org/model").await.unwrap().is_none());

        catalog.set_quant_progress("org/model", "q4_k_m").await.unwrap();
        assert_eq!(
            catalog.get_quant_progress("org/model").await.unwrap(),
            Some("q4_k_m".to_string())
        );

        catalog.clear_quant_progress("org/model").await.unwrap();
        assert!(catalog.get_quant_progress("org/model").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_import_many() {
        let catalog = MemoryCatalog::new();
        catalog.put_if_absent("a/one", &entry()).await.unwrap();

        let mut defaults = entry();
        defaults.converted = true;
        let summary = catalog
            .import_many(
                &["a/one".to_string(), "b/two".to_string()],
                &defaults,
            )
            .await
            .unwrap();
        assert_eq!(summary, ImportSummary { added: 1, updated: 1 });

        assert!(catalog.get("a/one").await.unwrap().unwrap().converted);
        assert!(catalog.get("b/two").await.unwrap().unwrap().converted);
    }

    #[tokio::test]
    async fn test_backup_restore_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = dir.path().join("backup1.json");
        let second = dir.path().join("backup2.json");

        let catalog = MemoryCatalog::new();
        catalog.put_if_absent("a/one", &entry()).await.unwrap();
        catalog.put_if_absent("b/two", &entry()).await.unwrap();
        catalog.backup(&first).await.unwrap();

        let restored = MemoryCatalog::new();
        restored.restore(&first).await.unwrap();
        restored.backup(&second).await.unwrap();

        let one = std::fs::read_to_string(&first).unwrap();
        let two = std::fs::read_to_string(&second).unwrap();
        assert_eq!(one, two);
        assert_eq!(restored.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let catalog = MemoryCatalog::new();
        catalog.put_if_absent("org/model", &entry()).await.unwrap();
        assert!(catalog.delete("org/model").await.unwrap());
        assert!(!catalog.delete("org/model").await.unwrap());
    }
}
