//! llama.cpp toolchain backend.
//!
//! Wraps the external programs the pipeline drives: `convert_hf_to_gguf.py`
//! for base-precision conversion, `llama-quantize`, `llama-imatrix`, the
//! GGUF metadata updater, and a tensor-info dump used by the rule engine.
//! All of them live in (or next to) a llama.cpp checkout.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

use super::pipeline::{check_success, run_streaming};
use crate::error::{ForgeError, Result};
use crate::quant::TensorInfo;

/// Intermediate container precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaseType {
    #[default]
    Bf16,
    Mxfp4,
}

impl BaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseType::Bf16 => "bf16",
            BaseType::Mxfp4 => "mxfp4",
        }
    }
}

impl std::fmt::Display for BaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One quantizer invocation.
#[derive(Debug, Clone)]
pub struct QuantizeRequest {
    pub source: PathBuf,
    pub dest: PathBuf,
    /// Target quant symbol, e.g. `Q4_K_M`.
    pub target: String,
    pub output_type: Option<String>,
    pub embed_type: Option<String>,
    pub imatrix: Option<PathBuf>,
    pub pure: bool,
    pub allow_requantize: bool,
    /// Per-tensor overrides from the rule engine, `(name, precision)`.
    pub overrides: Vec<(String, String)>,
    pub threads: usize,
}

/// The external conversion toolchain, reduced to the operations the
/// orchestrator needs. Tests substitute a scripted implementation.
#[async_trait::async_trait]
pub trait Toolchain: Send + Sync {
    /// Convert on-disk weights to the intermediate container.
    async fn convert_to_base(
        &self,
        source_dir: &Path,
        outfile: &Path,
        model_name: &str,
        outtype: BaseType,
    ) -> Result<()>;

    /// Sidecar multimodal-projection conversion.
    async fn convert_mmproj(
        &self,
        source_dir: &Path,
        outfile: &Path,
        model_name: &str,
        outtype: &str,
    ) -> Result<()>;

    /// Rewrite a GGUF file with refreshed metadata, in place.
    async fn add_metadata(&self, gguf: &Path) -> Result<()>;

    /// Generate an importance matrix from the base model.
    async fn generate_imatrix(&self, base_model: &Path, out: &Path) -> Result<()>;

    /// Run one quantization.
    async fn quantize(&self, request: &QuantizeRequest) -> Result<()>;

    /// Per-tensor precision symbols of an intermediate container.
    async fn tensor_types(&self, gguf: &Path) -> Result<Vec<TensorInfo>>;

    /// Update and rebuild the toolchain itself.
    async fn rebuild(&self) -> Result<()>;
}

/// Production [`Toolchain`] against a llama.cpp checkout.
pub struct LlamaCppToolchain {
    /// llama.cpp checkout; binaries are copied to its top level after builds.
    llama_dir: PathBuf,
    /// Calibration text for local imatrix generation.
    training_set: PathBuf,
    threads: usize,
}

impl LlamaCppToolchain {
    pub fn new(llama_dir: impl Into<PathBuf>, training_set: impl Into<PathBuf>) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            llama_dir: llama_dir.into(),
            training_set: training_set.into(),
            threads,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn quantize_binary(&self) -> PathBuf {
        self.llama_dir.join("llama-quantize")
    }

    pub fn imatrix_binary(&self) -> PathBuf {
        self.llama_dir.join("llama-imatrix")
    }

    pub fn convert_script(&self) -> PathBuf {
        self.llama_dir.join("convert_hf_to_gguf.py")
    }

    /// Metadata updater shipped with llama.cpp's gguf-py.
    pub fn metadata_script(&self) -> PathBuf {
        self.llama_dir
            .join("gguf-py")
            .join("gguf")
            .join("scripts")
            .join("update_gguf.py")
    }

    /// Tensor-info dump living alongside the checkout.
    pub fn tensor_info_script(&self) -> PathBuf {
        self.llama_dir.join("gguf_tensor_info.py")
    }

    fn build_dir(&self) -> PathBuf {
        self.llama_dir.join("build")
    }
}

#[async_trait::async_trait]
impl Toolchain for LlamaCppToolchain {
    async fn convert_to_base(
        &self,
        source_dir: &Path,
        outfile: &Path,
        model_name: &str,
        outtype: BaseType,
    ) -> Result<()> {
        let mut cmd = Command::new("python3");
        cmd.arg(self.convert_script())
            .arg(source_dir)
            .arg("--outfile")
            .arg(outfile)
            .arg("--model-name")
            .arg(model_name)
            .arg("--outtype")
            .arg(outtype.as_str());

        let output = run_streaming(cmd, "convert_hf_to_gguf.py").await?;
        check_success(&output, "convert_hf_to_gguf.py")?;
        info!("Successfully created {} GGUF: {}", outtype, outfile.display());
        Ok(())
    }

    async fn convert_mmproj(
        &self,
        source_dir: &Path,
        outfile: &Path,
        model_name: &str,
        outtype: &str,
    ) -> Result<()> {
        let mut cmd = Command::new("python3");
        cmd.arg(self.convert_script())
            .arg(source_dir)
            .arg("--outfile")
            .arg(outfile)
            .arg("--model-name")
            .arg(model_name)
            .arg("--mmproj")
            .arg("--outtype")
            .arg(outtype);

        let output = run_streaming(cmd, "convert_hf_to_gguf.py (mmproj)").await?;
        check_success(&output, "convert_hf_to_gguf.py (mmproj)")
    }

    async fn add_metadata(&self, gguf: &Path) -> Result<()> {
        if !gguf.is_file() {
            return Err(ForgeError::FileNotFound(gguf.to_path_buf()));
        }

        // The updater writes a fresh file; only replace the original after
        // it exits cleanly.
        let temp = tempfile::NamedTempFile::new().map_err(ForgeError::from)?;
        let temp_path = temp.path().to_path_buf();

        let mut cmd = Command::new("python3");
        cmd.arg(self.metadata_script())
            .arg(gguf)
            .arg(&temp_path)
            .arg("--force");

        let output = run_streaming(cmd, "update_gguf.py").await?;
        check_success(&output, "update_gguf.py")?;

        tokio::fs::remove_file(gguf)
            .await
            .map_err(|e| ForgeError::io_with_path(e, gguf))?;
        // The temp file lives on another mount in some deployments, so copy
        // rather than rename.
        tokio::fs::copy(&temp_path, gguf)
            .await
            .map_err(|e| ForgeError::io_with_path(e, gguf))?;
        Ok(())
    }

    async fn generate_imatrix(&self, base_model: &Path, out: &Path) -> Result<()> {
        if !base_model.exists() {
            return Err(ForgeError::ImatrixFailed {
                message: format!("cannot generate imatrix: {} not found", base_model.display()),
            });
        }

        let mut cmd = Command::new(self.imatrix_binary());
        cmd.arg("-m")
            .arg(base_model)
            .arg("-f")
            .arg(&self.training_set)
            .arg("-o")
            .arg(out)
            .arg("--threads")
            .arg(self.threads.to_string());

        let output = run_streaming(cmd, "llama-imatrix").await?;
        if !output.success() {
            return Err(ForgeError::ImatrixFailed {
                message: format!("llama-imatrix failed: {}", output.stderr.trim()),
            });
        }
        info!("Successfully generated imatrix file");
        Ok(())
    }

    async fn quantize(&self, request: &QuantizeRequest) -> Result<()> {
        let mut cmd = Command::new(self.quantize_binary());
        if request.allow_requantize {
            cmd.arg("--allow-requantize");
        }
        if let Some(imatrix) = &request.imatrix {
            cmd.arg("--imatrix").arg(imatrix);
        }
        if request.pure {
            cmd.arg("--pure");
        }
        if let (Some(output_type), Some(embed_type)) = (&request.output_type, &request.embed_type) {
            cmd.arg("--output-tensor-type").arg(output_type);
            cmd.arg("--token-embedding-type").arg(embed_type);
        }
        for (name, quant) in &request.overrides {
            cmd.arg("--tensor-type").arg(format!("{name}={quant}"));
        }
        cmd.arg(&request.source)
            .arg(&request.dest)
            .arg(&request.target)
            .arg(request.threads.to_string());

        let output = run_streaming(cmd, "llama-quantize").await?;
        if !output.success() {
            return Err(ForgeError::QuantizeFailed {
                quant: request.target.clone(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn tensor_types(&self, gguf: &Path) -> Result<Vec<TensorInfo>> {
        let out = tempfile::NamedTempFile::new().map_err(ForgeError::from)?;
        let out_path = out.path().to_path_buf();

        let mut cmd = Command::new("python3");
        cmd.arg(self.tensor_info_script())
            .arg(gguf)
            .arg("-o")
            .arg(&out_path);

        let output = run_streaming(cmd, "gguf_tensor_info.py").await?;
        check_success(&output, "gguf_tensor_info.py")?;

        let raw = tokio::fs::read_to_string(&out_path)
            .await
            .map_err(|e| ForgeError::io_with_path(e, &out_path))?;
        Ok(parse_tensor_dump(&raw))
    }

    async fn rebuild(&self) -> Result<()> {
        info!("Updating and rebuilding llama.cpp");

        let mut pull = Command::new("git");
        pull.arg("pull").current_dir(&self.llama_dir);
        let output = run_streaming(pull, "git pull").await?;
        if !output.success() {
            warn!("git pull failed (non-fatal): {}", output.stderr.trim());
        }

        let mut configure = Command::new("cmake");
        configure
            .arg("-B")
            .arg(self.build_dir())
            .arg("-DLLAMA_CURL=OFF")
            .current_dir(&self.llama_dir);
        let output = run_streaming(configure, "cmake configure").await?;
        check_success(&output, "cmake configure")?;

        let mut build = Command::new("cmake");
        build
            .arg("--build")
            .arg(self.build_dir())
            .arg("--config")
            .arg("Release")
            .arg("-j")
            .current_dir(&self.llama_dir);
        let output = run_streaming(build, "cmake build").await?;
        check_success(&output, "cmake build")?;

        // Binaries are invoked from the checkout top level.
        let bin_dir = self.build_dir().join("bin");
        let mut entries = tokio::fs::read_dir(&bin_dir)
            .await
            .map_err(|e| ForgeError::io_with_path(e, &bin_dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ForgeError::io_with_path(e, &bin_dir))?
        {
            let dest = self.llama_dir.join(entry.file_name());
            tokio::fs::copy(entry.path(), dest)
                .await
                .map_err(|e| ForgeError::io_with_path(e, entry.path()))?;
        }

        info!("llama.cpp rebuild complete");
        Ok(())
    }
}

/// Parse `name=TYPE (raw)` lines from the tensor-info dump.
fn parse_tensor_dump(raw: &str) -> Vec<TensorInfo> {
    raw.lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once('=')?;
            let dtype = rest.split(' ').next().unwrap_or(rest);
            if name.is_empty() || dtype.is_empty() {
                return None;
            }
            Some(TensorInfo {
                name: name.trim().to_string(),
                dtype: dtype.trim().to_string(),
            })
        })
        .collect()
}
