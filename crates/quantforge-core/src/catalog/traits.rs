//! Catalog backend trait and entry types.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Redis key of the registry hash (`model key → entry JSON`).
pub const REGISTRY_KEY: &str = "model:catalog";
/// Redis key of the converting set.
pub const CONVERTING_KEY: &str = "model:converting";
/// Redis key of the quant-progress hash.
pub const PROGRESS_KEY: &str = "model:converting:progress";
/// Redis key of the failed/resumable set.
pub const FAILED_KEY: &str = "model:converting:failed";

/// One catalog entry, keyed externally by the hierarchical `owner/name` id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// When the entry was created.
    pub added: DateTime<Utc>,
    /// Parameter count; `-1` means unknown.
    pub parameters: i64,
    /// Whether the upstream repository exposes a structured config blob.
    pub has_config: bool,
    /// Mixture-of-Experts indicator, consulted by the rule engine.
    #[serde(default)]
    pub is_moe: bool,
    /// Whether a full conversion has completed.
    pub converted: bool,
    /// Orchestrator invocations so far; monotonically non-decreasing.
    pub attempts: u32,
    /// Most recent orchestrator invocation.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Most recent successful full conversion.
    pub success_date: Option<DateTime<Utc>>,
    /// Free-text error messages, cleared on success.
    #[serde(default)]
    pub error_log: Vec<String>,
    /// Completed quant identifiers (advisory).
    #[serde(default)]
    pub quantizations: Vec<String>,
}

impl ModelEntry {
    /// A fresh, unconverted entry.
    pub fn new(parameters: i64, has_config: bool, is_moe: bool) -> Self {
        Self {
            added: Utc::now(),
            parameters,
            has_config,
            is_moe,
            converted: false,
            attempts: 0,
            last_attempt: None,
            success_date: None,
            error_log: Vec::new(),
            quantizations: Vec::new(),
        }
    }
}

/// Summary of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub updated: usize,
}

/// Normalize a field value so preconditions compare by meaning.
///
/// Truthy strings (`"true"`, `"yes"`, `"1"`) become `true`, their negations
/// `false`; other strings that parse as JSON scalars are parsed. Non-string
/// values pass through unchanged.
pub fn normalize_value(value: &Value) -> Value {
    if let Value::String(s) = value {
        match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => return Value::Bool(true),
            "false" | "no" | "0" => return Value::Bool(false),
            other => {
                if let Ok(parsed) = serde_json::from_str::<Value>(other) {
                    return parsed;
                }
            }
        }
    }
    value.clone()
}

/// Outcome of planning a single-field update against an observed entry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UpdatePlan {
    /// Field already holds the desired value; succeed without a write.
    NoOp,
    /// Commit this rewritten entry object.
    Write(Value),
    /// A precondition did not match the observed entry.
    ConditionFailed,
}

/// Decide how to update `field` on an observed entry object.
///
/// Shared by every backend so the no-op and precondition semantics cannot
/// drift between them.
pub(crate) fn plan_field_update(
    entry: &Value,
    field: &str,
    value: &Value,
    condition: Option<&serde_json::Map<String, Value>>,
) -> UpdatePlan {
    let current = entry.get(field).cloned().unwrap_or(Value::Null);
    let desired = normalize_value(value);

    if normalize_value(&current) == desired {
        return UpdatePlan::NoOp;
    }

    if let Some(cond) = condition {
        for (name, expected) in cond {
            let observed = entry.get(name.as_str()).cloned().unwrap_or(Value::Null);
            if normalize_value(&observed) != normalize_value(expected) {
                return UpdatePlan::ConditionFailed;
            }
        }
    }

    let mut updated = entry.clone();
    if let Some(obj) = updated.as_object_mut() {
        obj.insert(field.to_string(), desired);
    }
    UpdatePlan::Write(updated)
}

/// Thread- and process-safe model catalog.
///
/// Every write to a single entry is atomic with respect to other writers:
/// implementations observe the current entry, apply the mutation, and commit
/// conditional on the observation being unchanged, retrying on conflict with
/// a small budget. A successful [`update_field`](CatalogStore::update_field)
/// does not imply the stored value changed: updating to the already-stored
/// value succeeds without a write.
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    /// Fetch a single entry.
    async fn get(&self, key: &str) -> Result<Option<ModelEntry>>;

    /// Insert an entry if the key is absent. Returns whether it was inserted.
    async fn put_if_absent(&self, key: &str, entry: &ModelEntry) -> Result<bool>;

    /// Update one field, optionally gated on a precondition map of
    /// `{field → expected value}`. Returns `true` when the field now holds
    /// the desired value (including the no-op case), `false` when the entry
    /// is missing or a precondition failed.
    async fn update_field(
        &self,
        key: &str,
        field: &str,
        value: Value,
        condition: Option<&serde_json::Map<String, Value>>,
    ) -> Result<bool>;

    /// Delete an entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Snapshot of the whole registry.
    async fn all(&self) -> Result<BTreeMap<String, ModelEntry>>;

    /// Bulk import: adds missing keys with `defaults`, marks existing
    /// unconverted keys as converted. Performed as one transactional
    /// replace of the registry.
    async fn import_many(&self, keys: &[String], defaults: &ModelEntry) -> Result<ImportSummary>;

    /// Write the registry to a JSON file (`model key → entry`).
    async fn backup(&self, path: &Path) -> Result<()>;

    /// Replace registry contents from a JSON backup file.
    async fn restore(&self, path: &Path) -> Result<()>;

    // -- Converting set ------------------------------------------------------

    /// Add a key to the converting set. Returns whether it was newly added.
    async fn mark_converting(&self, key: &str) -> Result<bool>;

    /// Remove a key from the converting set.
    async fn unmark_converting(&self, key: &str) -> Result<()>;

    /// Members of the converting set.
    async fn converting_members(&self) -> Result<Vec<String>>;

    /// Whether a key is in the converting set.
    async fn is_converting(&self, key: &str) -> Result<bool>;

    // -- Failed set ----------------------------------------------------------

    /// Mark a key as interrupted-but-resumable.
    async fn mark_failed(&self, key: &str) -> Result<()>;

    /// Remove a key from the failed set.
    async fn unmark_failed(&self, key: &str) -> Result<()>;

    /// Whether a key is in the failed set.
    async fn is_failed(&self, key: &str) -> Result<bool>;

    // -- Quant progress ------------------------------------------------------

    /// Record the last completed quant step (or the `imatrix` sentinel).
    async fn set_quant_progress(&self, key: &str, quant_id: &str) -> Result<()>;

    /// The last completed quant step, if a conversion is in flight.
    async fn get_quant_progress(&self, key: &str) -> Result<Option<String>>;

    /// Drop the quant-progress cursor.
    async fn clear_quant_progress(&self, key: &str) -> Result<()>;
}
