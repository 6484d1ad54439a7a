//! The conversion pipeline: subprocess plumbing, the external toolchain
//! contract, importance-matrix acquisition, and the per-model orchestrator.

mod imatrix;
mod llama_cpp;
mod orchestrator;
mod pipeline;

pub use imatrix::{imatrix_urls, ImatrixFetcher};
pub use llama_cpp::{BaseType, LlamaCppToolchain, QuantizeRequest, Toolchain};
pub use orchestrator::{ConvertOptions, Orchestrator, RunStatus, IMATRIX_SENTINEL};
pub use pipeline::{check_success, run_streaming, CommandOutput};
