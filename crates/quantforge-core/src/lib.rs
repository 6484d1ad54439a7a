//! quantforge - automated GGUF quantization of Hub models.
//!
//! A long-running daemon selects candidate models from a durable catalog,
//! downloads their weights, converts them to a high-precision GGUF
//! container, produces a family of quantized variants under a per-tensor
//! precision policy, chunks oversize artifacts, uploads everything into a
//! per-model Hub repository, and records durable progress so interrupted
//! conversions resume without repeating expensive work.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quantforge::{
//!     catalog::MemoryCatalog,
//!     convert::{ConvertOptions, LlamaCppToolchain, Orchestrator},
//!     disk::DiskManager,
//!     hub::HttpHub,
//!     quant::{load_quant_configs, RuleEngine},
//! };
//!
//! # async fn run() -> quantforge::Result<()> {
//! use std::path::Path;
//!
//! let catalog = Arc::new(MemoryCatalog::new());
//! let hub = Arc::new(HttpHub::new("hf_...")?);
//! let toolchain = Arc::new(LlamaCppToolchain::new(
//!     "/srv/models/llama.cpp",
//!     "/srv/models/imatrix-train-set",
//! ));
//! let orchestrator = Orchestrator::new(
//!     catalog,
//!     hub,
//!     toolchain,
//!     DiskManager::new("/root/.cache/huggingface", "/srv/models"),
//!     RuleEngine::load(Path::new("config/quant_rules.json"))?,
//!     load_quant_configs(Path::new("config/quant_configs.json"))?,
//!     "/srv/imatrix-files",
//!     "/srv/models",
//!     "quantforge",
//! );
//! orchestrator
//!     .convert_model("google/gemma-3-1b-it", &ConvertOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod disk;
pub mod error;
pub mod hub;
pub mod quant;
pub mod scheduler;

// Re-export commonly used types
pub use batch::{load_manifest, BatchDriver, Manifest};
pub use catalog::{CatalogStore, MemoryCatalog, ModelEntry, RedisCatalog};
pub use config::{ConvertConfig, DiskConfig, ForgeEnv, HubConfig, PathsConfig, UploadConfig};
pub use convert::{
    BaseType, ConvertOptions, LlamaCppToolchain, Orchestrator, RunStatus, Toolchain,
};
pub use disk::{DiskManager, ReclaimOutcome};
pub use error::{ForgeError, Result};
pub use hub::{HttpHub, HubApi, Uploader};
pub use quant::{QuantConfig, RuleEngine};
pub use scheduler::Scheduler;
