//! Durable model catalog.
//!
//! The catalog is the single source of truth for candidate models, their
//! conversion state, and the three auxiliary structures that make the
//! pipeline resumable across crashes: the converting set, the failed set,
//! and the per-model quant-progress cursor.

mod memory;
mod redis;
mod traits;

pub use memory::MemoryCatalog;
pub use self::redis::RedisCatalog;
pub use traits::{
    normalize_value, CatalogStore, ImportSummary, ModelEntry, CONVERTING_KEY, FAILED_KEY,
    PROGRESS_KEY, REGISTRY_KEY,
};
