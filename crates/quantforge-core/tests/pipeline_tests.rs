//! Orchestrator integration tests against an in-memory catalog, a mock Hub,
//! and a scripted toolchain.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use quantforge::catalog::{CatalogStore, MemoryCatalog, ModelEntry};
use quantforge::convert::{
    BaseType, ConvertOptions, Orchestrator, QuantizeRequest, RunStatus, Toolchain,
};
use quantforge::disk::DiskManager;
use quantforge::error::{ForgeError, Result};
use quantforge::hub::{HubApi, RemoteFileMeta, RepoInfo, TrendingModel};
use quantforge::quant::{QuantConfig, QuantRule, RuleEngine, TensorInfo};
use tempfile::TempDir;

const MODEL: &str = "org/demo-7b";

// ---------------------------------------------------------------------------
// Mock Hub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockHub {
    uploads: Mutex<Vec<(String, String)>>,
    created_repos: Mutex<Vec<String>>,
    /// Uploads whose repo path contains this substring fail.
    fail_uploads_matching: Mutex<Option<String>>,
    /// After this many successful uploads, every further upload fails.
    fail_after_uploads: Mutex<Option<usize>>,
}

impl MockHub {
    fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    fn upload_paths(&self) -> Vec<String> {
        self.uploads().into_iter().map(|(_, path)| path).collect()
    }
}

#[async_trait::async_trait]
impl HubApi for MockHub {
    async fn trending_models(&self, _limit: usize) -> Result<Vec<TrendingModel>> {
        Ok(Vec::new())
    }

    async fn repo_info(&self, _repo_id: &str) -> Result<Option<RepoInfo>> {
        Ok(Some(RepoInfo::default()))
    }

    async fn raw_json(&self, _repo_id: &str, _filename: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn download_repo(&self, _repo_id: &str, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dest_dir).await.unwrap();
        let config = dest_dir.join("config.json");
        tokio::fs::write(&config, b"{}").await.unwrap();
        Ok(vec![config])
    }

    async fn download_url(&self, url: &str, _dest: &Path) -> Result<()> {
        // No prebuilt imatrix anywhere; forces local generation.
        Err(ForgeError::DownloadFailed {
            url: url.to_string(),
            message: "not found".to_string(),
        })
    }

    async fn create_repo(&self, repo_id: &str) -> Result<()> {
        self.created_repos.lock().unwrap().push(repo_id.to_string());
        Ok(())
    }

    async fn upload_file(&self, _local: &Path, repo_id: &str, path_in_repo: &str) -> Result<()> {
        if let Some(marker) = self.fail_uploads_matching.lock().unwrap().as_deref() {
            if path_in_repo.contains(marker) {
                return Err(ForgeError::UploadFailed {
                    path: path_in_repo.to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }
        {
            let limit = *self.fail_after_uploads.lock().unwrap();
            if let Some(limit) = limit {
                if self.uploads.lock().unwrap().len() >= limit {
                    return Err(ForgeError::UploadFailed {
                        path: path_in_repo.to_string(),
                        message: "injected failure".to_string(),
                    });
                }
            }
        }
        self.uploads
            .lock()
            .unwrap()
            .push((repo_id.to_string(), path_in_repo.to_string()));
        Ok(())
    }

    async fn remote_file_meta(&self, _repo_id: &str, _path: &str) -> Result<Option<RemoteFileMeta>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Scripted toolchain
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedToolchain {
    fail_convert: AtomicBool,
    /// Target quants whose quantize call fails outright.
    fail_targets: Mutex<HashSet<String>>,
    /// Reject Q5_K/Q6_K output/embed pairings like the real quantizer does
    /// for some targets.
    reject_q5k_types: AtomicBool,
    quantize_calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Toolchain for ScriptedToolchain {
    async fn convert_to_base(
        &self,
        _source_dir: &Path,
        outfile: &Path,
        _model_name: &str,
        _outtype: BaseType,
    ) -> Result<()> {
        if self.fail_convert.load(Ordering::SeqCst) {
            return Err(ForgeError::ConversionFailed {
                message: "converter blew up".to_string(),
            });
        }
        tokio::fs::create_dir_all(outfile.parent().unwrap()).await.unwrap();
        tokio::fs::write(outfile, b"GGUF-base").await.unwrap();
        Ok(())
    }

    async fn convert_mmproj(
        &self,
        _source_dir: &Path,
        _outfile: &Path,
        _model_name: &str,
        outtype: &str,
    ) -> Result<()> {
        // Text-only model: no projection tensors.
        Err(ForgeError::ConversionFailed {
            message: format!("no mmproj tensors for {outtype}"),
        })
    }

    async fn add_metadata(&self, _gguf: &Path) -> Result<()> {
        Ok(())
    }

    async fn generate_imatrix(&self, _base_model: &Path, out: &Path) -> Result<()> {
        tokio::fs::write(out, b"imatrix-data").await.unwrap();
        Ok(())
    }

    async fn quantize(&self, request: &QuantizeRequest) -> Result<()> {
        self.quantize_calls
            .lock()
            .unwrap()
            .push(request.target.clone());
        if self.fail_targets.lock().unwrap().contains(&request.target) {
            return Err(ForgeError::QuantizeFailed {
                quant: request.target.clone(),
                message: "injected failure".to_string(),
            });
        }
        if self.reject_q5k_types.load(Ordering::SeqCst) {
            let risky = |t: &Option<String>| {
                matches!(t.as_deref(), Some("Q5_K") | Some("Q6_K"))
            };
            if risky(&request.output_type) || risky(&request.embed_type) {
                return Err(ForgeError::QuantizeFailed {
                    quant: request.target.clone(),
                    message: "tensor type rejected".to_string(),
                });
            }
        }
        tokio::fs::write(&request.dest, b"GGUF-quant").await.unwrap();
        Ok(())
    }

    async fn tensor_types(&self, _gguf: &Path) -> Result<Vec<TensorInfo>> {
        Ok(vec![
            TensorInfo {
                name: "token_embd".to_string(),
                dtype: "BF16".to_string(),
            },
            TensorInfo {
                name: "blk.0.ffn_down".to_string(),
                dtype: "BF16".to_string(),
            },
            TensorInfo {
                name: "blk.1.attn_norm".to_string(),
                dtype: "F32".to_string(),
            },
        ])
    }

    async fn rebuild(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    _tmp: TempDir,
    catalog: Arc<MemoryCatalog>,
    hub: Arc<MockHub>,
    toolchain: Arc<ScriptedToolchain>,
    orchestrator: Arc<Orchestrator>,
    models_dir: PathBuf,
}

fn quant_config(name: &str, target: &str) -> QuantConfig {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "type": target,
        "embed_type": "",
        "output_type": "",
        "use_imatrix": false,
        "use_pure": false,
    }))
    .unwrap()
}

fn default_configs() -> Vec<QuantConfig> {
    vec![
        quant_config("q4_k_m", "Q4_K_M"),
        quant_config("q5_k_m", "Q5_K_M"),
        quant_config("q8_0", "Q8_0"),
    ]
}

fn fixture(configs: Vec<QuantConfig>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let models_dir = tmp.path().join("models");
    let catalog = Arc::new(MemoryCatalog::new());
    let hub = Arc::new(MockHub::default());
    let toolchain = Arc::new(ScriptedToolchain::default());

    let rules = RuleEngine::from_rules(vec![QuantRule {
        base_type: vec!["Q4_K".into()],
        layer_name: vec!["token_embd*".into()],
        bump: Some(1),
        ..Default::default()
    }]);

    let disk = DiskManager::new(tmp.path().join("cache"), models_dir.clone())
        .with_min_required_bytes(1);

    let orchestrator = Orchestrator::new(
        catalog.clone(),
        hub.clone(),
        toolchain.clone(),
        disk,
        rules,
        configs,
        tmp.path().join("imatrix-files"),
        models_dir.clone(),
        "quantforge",
    );

    Fixture {
        _tmp: tmp,
        catalog,
        hub,
        toolchain,
        orchestrator: Arc::new(orchestrator),
        models_dir,
    }
}

fn entry() -> ModelEntry {
    // Small parameter count keeps the space estimate trivial while still
    // clearing the 3-bit planner threshold with 4-bit-and-up configs.
    ModelEntry::new(1_000_000, true, false)
}

async fn seed(fixture: &Fixture) {
    fixture.catalog.put_if_absent(MODEL, &entry()).await.unwrap();
}

fn write_base_file(fixture: &Fixture) {
    let dir = fixture.models_dir.join("demo-7b");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("demo-7b-bf16.gguf"), b"GGUF-base").unwrap();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_conversion_happy_path() {
    let f = fixture(default_configs());
    seed(&f).await;

    let status = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let after = f.catalog.get(MODEL).await.unwrap().unwrap();
    assert!(after.converted);
    assert_eq!(after.attempts, 1);
    assert!(after.success_date.is_some());
    assert!(after.last_attempt.is_some());
    assert!(after.error_log.is_empty());
    assert_eq!(after.quantizations, vec!["q4_k_m", "q5_k_m", "q8_0"]);

    assert!(!f.catalog.is_converting(MODEL).await.unwrap());
    assert!(!f.catalog.is_failed(MODEL).await.unwrap());
    assert!(f.catalog.get_quant_progress(MODEL).await.unwrap().is_none());

    // One repo, every artifact in its quant folder, imatrix uploaded last.
    assert_eq!(
        f.hub.created_repos.lock().unwrap().clone(),
        vec!["quantforge/demo-7b-GGUF"]
    );
    let paths = f.hub.upload_paths();
    assert!(paths.contains(&"q4-k-m/demo-7b-q4_k_m.gguf".to_string()));
    assert!(paths.contains(&"q5-k-m/demo-7b-q5_k_m.gguf".to_string()));
    assert!(paths.contains(&"q8-0/demo-7b-q8_0.gguf".to_string()));
    assert!(paths.contains(&"imatrix/demo-7b.imatrix".to_string()));

    // The base artifact is never deleted by the pipeline; quantized
    // artifacts are removed after upload.
    let model_dir = f.models_dir.join("demo-7b");
    assert!(model_dir.join("demo-7b-bf16.gguf").exists());
    assert!(!model_dir.join("demo-7b-q4_k_m.gguf").exists());
}

#[tokio::test]
async fn second_run_on_converted_model_is_a_noop() {
    let f = fixture(default_configs());
    seed(&f).await;

    let first = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(first, RunStatus::Completed);
    let uploads_after_first = f.hub.uploads().len();
    let calls_after_first = f.toolchain.quantize_calls.lock().unwrap().len();

    let second = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(second, RunStatus::Skipped("already converted".to_string()));

    // Nothing ran again, and the attempt counter did not move.
    assert_eq!(f.hub.uploads().len(), uploads_after_first);
    assert_eq!(
        f.toolchain.quantize_calls.lock().unwrap().len(),
        calls_after_first
    );
    assert_eq!(f.catalog.get(MODEL).await.unwrap().unwrap().attempts, 1);
}

#[tokio::test]
async fn step_failure_continues_with_next_config() {
    let f = fixture(default_configs());
    seed(&f).await;
    f.toolchain
        .fail_targets
        .lock()
        .unwrap()
        .insert("Q5_K_M".to_string());

    let status = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let after = f.catalog.get(MODEL).await.unwrap().unwrap();
    assert!(after.converted);
    assert_eq!(after.quantizations, vec!["q4_k_m", "q8_0"]);

    let paths = f.hub.upload_paths();
    assert!(paths.iter().any(|p| p.starts_with("q4-k-m/")));
    assert!(!paths.iter().any(|p| p.starts_with("q5-k-m/")));
    assert!(paths.iter().any(|p| p.starts_with("q8-0/")));
}

#[tokio::test]
async fn q5k_rejection_falls_back_to_q5_1() {
    let mut configs = default_configs();
    configs[0] = serde_json::from_value(serde_json::json!({
        "name": "q4_k_m",
        "type": "Q4_K_M",
        "embed_type": "Q6_K",
        "output_type": "Q6_K",
        "use_imatrix": false,
        "use_pure": false,
    }))
    .unwrap();
    let f = fixture(configs);
    seed(&f).await;
    f.toolchain.reject_q5k_types.store(true, Ordering::SeqCst);

    let status = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    // The q4_k_m step was attempted twice (original types, then Q5_1).
    let calls = f.toolchain.quantize_calls.lock().unwrap().clone();
    assert_eq!(calls.iter().filter(|t| *t == "Q4_K_M").count(), 2);
    assert!(f.hub.upload_paths().iter().any(|p| p.starts_with("q4-k-m/")));
}

#[tokio::test]
async fn resume_skips_committed_steps() {
    let f = fixture(default_configs());
    seed(&f).await;
    write_base_file(&f);

    // An earlier process committed q4_k_m, then died.
    f.catalog.mark_converting(MODEL).await.unwrap();
    f.catalog.mark_failed(MODEL).await.unwrap();
    f.catalog.set_quant_progress(MODEL, "q4_k_m").await.unwrap();

    let status = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let calls = f.toolchain.quantize_calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["Q5_K_M", "Q8_0"]);
    assert!(!f.hub.upload_paths().iter().any(|p| p.starts_with("q4-k-m/")));
}

#[tokio::test]
async fn refuses_duplicate_work_without_failed_mark() {
    let f = fixture(default_configs());
    seed(&f).await;
    f.catalog.mark_converting(MODEL).await.unwrap();

    let status = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Skipped("already converting".to_string()));

    // Attempts untouched; still locked by the other process.
    let after = f.catalog.get(MODEL).await.unwrap().unwrap();
    assert_eq!(after.attempts, 0);
    assert!(f.catalog.is_converting(MODEL).await.unwrap());
}

#[tokio::test]
async fn attempts_cap_skips_and_unlocks() {
    let f = fixture(default_configs());
    let mut capped = entry();
    capped.attempts = 3;
    f.catalog.put_if_absent(MODEL, &capped).await.unwrap();
    f.catalog.mark_converting(MODEL).await.unwrap();
    f.catalog.mark_failed(MODEL).await.unwrap();

    let status = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Skipped("max attempts reached".to_string()));
    assert!(!f.catalog.is_converting(MODEL).await.unwrap());

    let after = f.catalog.get(MODEL).await.unwrap().unwrap();
    assert_eq!(after.attempts, 3);
    assert!(!after.converted);
}

#[tokio::test]
async fn converter_failure_marks_resumable() {
    let f = fixture(default_configs());
    seed(&f).await;
    f.toolchain.fail_convert.store(true, Ordering::SeqCst);

    let err = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("converter blew up"));

    let after = f.catalog.get(MODEL).await.unwrap().unwrap();
    assert_eq!(after.attempts, 1);
    assert!(!after.converted);
    assert!(!after.error_log.is_empty());
    assert!(f.catalog.is_failed(MODEL).await.unwrap());
    // No resumable progress, so the lock is released.
    assert!(!f.catalog.is_converting(MODEL).await.unwrap());
    assert!(f.hub.upload_paths().is_empty());
}

#[tokio::test]
async fn upload_failure_does_not_advance_cursor() {
    let f = fixture(default_configs());
    seed(&f).await;
    write_base_file(&f);
    *f.hub.fail_uploads_matching.lock().unwrap() = Some("q5-k-m/".to_string());

    let completed = f
        .orchestrator
        .quantize_and_upload(MODEL, 1_000_000, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(completed, vec!["q4_k_m", "q8_0"]);

    // The cursor records the last committed step only.
    assert_eq!(
        f.catalog.get_quant_progress(MODEL).await.unwrap(),
        Some("q8_0".to_string())
    );
    let after = f.catalog.get(MODEL).await.unwrap().unwrap();
    assert!(after.error_log.iter().any(|e| e.contains("q5_k_m")));
}

#[tokio::test]
async fn crash_and_resume_never_repeats_a_committed_step() {
    let f = fixture(default_configs());
    seed(&f).await;
    write_base_file(&f);

    // First run: the first upload lands, then the connection dies.
    *f.hub.fail_after_uploads.lock().unwrap() = Some(1);
    let completed = f
        .orchestrator
        .quantize_and_upload(MODEL, 1_000_000, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(completed, vec!["q4_k_m"]);
    assert_eq!(
        f.catalog.get_quant_progress(MODEL).await.unwrap(),
        Some("q4_k_m".to_string())
    );

    // Second run with the network back: only the remaining steps execute.
    *f.hub.fail_after_uploads.lock().unwrap() = None;
    let status = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let calls = f.toolchain.quantize_calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["Q4_K_M", "Q5_K_M", "Q8_0", "Q5_K_M", "Q8_0"]);

    // Each quant artifact was uploaded exactly once.
    let paths = f.hub.upload_paths();
    assert_eq!(paths.iter().filter(|p| p.starts_with("q4-k-m/")).count(), 1);
    assert_eq!(paths.iter().filter(|p| p.starts_with("q5-k-m/")).count(), 1);
    assert_eq!(paths.iter().filter(|p| p.starts_with("q8-0/")).count(), 1);
}

#[tokio::test]
async fn batch_driver_aborts_on_first_failure() {
    use quantforge::batch::BatchDriver;

    let f = fixture(default_configs());
    seed(&f).await;
    f.toolchain.fail_convert.store(true, Ordering::SeqCst);

    let manifest: quantforge::Manifest = serde_json::from_str(
        r#"{"models": ["org/demo-7b", {"name": "org/second-7b", "is_moe": true}]}"#,
    )
    .unwrap();

    let driver = BatchDriver::new(f.catalog.clone(), f.orchestrator.clone());
    assert!(driver.run(&manifest).await.is_err());

    // The first model was attempted; the second was never reached, so this
    // run never inserted it.
    let first = f.catalog.get("org/demo-7b").await.unwrap().unwrap();
    assert_eq!(first.attempts, 1);
    assert!(f.catalog.get("org/second-7b").await.unwrap().is_none());
}

#[tokio::test]
async fn batch_driver_converts_and_reconciles_moe() {
    use quantforge::batch::BatchDriver;

    let f = fixture(vec![quant_config("q8_0", "Q8_0")]);
    seed(&f).await;
    let manifest: quantforge::Manifest = serde_json::from_str(
        r#"{"models": [{"name": "org/demo-7b", "is_moe": true}]}"#,
    )
    .unwrap();

    let driver = BatchDriver::new(f.catalog.clone(), f.orchestrator.clone());
    driver.run(&manifest).await.unwrap();

    let after = f.catalog.get("org/demo-7b").await.unwrap().unwrap();
    assert!(after.converted);
    assert!(after.is_moe);
    assert_eq!(after.quantizations, vec!["q8_0"]);
}

#[tokio::test]
async fn disk_exhaustion_clears_lock_and_surfaces_fatal_error() {
    let f = fixture(default_configs());
    // An absurd parameter count no reclamation step can satisfy.
    let mut huge = entry();
    huge.parameters = 1_000_000_000_000_000;
    f.catalog.put_if_absent(MODEL, &huge).await.unwrap();

    let err = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::SpaceExhausted { .. }));

    // No work started, no lock left behind, no attempt consumed.
    assert!(!f.catalog.is_converting(MODEL).await.unwrap());
    let after = f.catalog.get(MODEL).await.unwrap().unwrap();
    assert_eq!(after.attempts, 0);
    assert!(f.hub.upload_paths().is_empty());
}

#[tokio::test]
async fn missing_catalog_entry_is_an_error() {
    let f = fixture(default_configs());
    let err = f
        .orchestrator
        .convert_model(MODEL, &ConvertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::ModelNotFound { .. }));
}
