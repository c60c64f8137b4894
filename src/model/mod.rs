use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nanoid::nanoid;
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::spawn_blocking;

use crate::domain::job::JobCounts;
use crate::pipeline::engine::FaceEngine;
use crate::pipeline::{run_pipeline, PipelineParams, PipelineRun, ProgressFn};
use crate::server::ServerConfig;
use crate::tools::file_tools::list_images;
use crate::tools::log::{log_error, log_info, LogServiceType};

pub mod error;
pub mod export;
pub mod jobs;
pub mod ledger;

use self::error::{Error, Result};
use self::jobs::{JobState, UploadRequest};
use self::ledger::{Ledger, LEDGER_FILE};

/// Shared application state: configuration, the analysis backend, and the
/// registry of live jobs. Cheap to clone, handed to every route.
#[derive(Clone)]
pub struct ModelController {
    config: Arc<ServerConfig>,
    engine: Arc<dyn FaceEngine>,
    jobs: Arc<RwLock<HashMap<String, Arc<JobState>>>>,
    pipeline_permits: Arc<Semaphore>,
}

impl ModelController {
    pub fn new(config: ServerConfig, engine: Arc<dyn FaceEngine>) -> Self {
        let workers = config.workers.max(1);
        Self {
            config: Arc::new(config),
            engine,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            pipeline_permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn job(&self, job_id: &str) -> Option<Arc<JobState>> {
        self.jobs.read().await.get(job_id).cloned()
    }

    async fn job_or_register(&self, job_id: &str) -> Arc<JobState> {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobState::new(job_id.to_string())))
            .clone()
    }
}

// region:    --- Upload & job lifecycle

impl ModelController {
    /// Receive one upload request (chunked or whole files) and apply the
    /// start policy: a client-provided job id starts only on `final`; without
    /// one, a request with no `final` field at all is a legacy single-shot
    /// upload and starts immediately.
    pub async fn upload(&self, request: UploadRequest) -> Result<Value> {
        if request.chunk.is_none() && request.files.is_empty() {
            return Err(Error::UploadBadChunkMeta("no file content in request".to_string()));
        }
        // A continuation chunk cannot be tied back to its job without an id.
        if request.job_id.is_none() {
            if let Some(chunk) = &request.chunk {
                if chunk.chunk_index > 0 {
                    return Err(Error::UploadMissingJobId);
                }
            }
        }

        let (job_id, client_provided) = match request.job_id.as_deref() {
            Some(id) if !id.is_empty() => (id.to_string(), true),
            _ => (nanoid!(), false),
        };
        let state = self.job_or_register(&job_id).await;
        let input_dir = self.config.job_input_dir(&job_id);
        tokio::fs::create_dir_all(&input_dir).await?;

        let mut received: Option<Value> = None;
        {
            let mut session = state.upload.lock().await;
            if let Some(chunk) = &request.chunk {
                session.store_chunk(
                    &input_dir,
                    &chunk.file_name,
                    chunk.chunk_index,
                    chunk.chunk_total,
                    &chunk.bytes,
                )?;
                received = Some(json!({
                    "file_name": chunk.file_name,
                    "chunk_index": chunk.chunk_index,
                    "chunk_total": chunk.chunk_total,
                }));
            }
            for (file_name, bytes) in &request.files {
                session.store_whole_file(&input_dir, file_name, bytes)?;
            }
        }

        let final_flag = request.final_field.unwrap_or(false);
        let should_start = if client_provided {
            final_flag
        } else {
            request.final_field.is_none() || final_flag
        };

        let mut started = false;
        if should_start {
            started = self.try_start(&state).await?;
        }
        let mut body = json!({ "job_id": job_id, "started": started });
        if let Some(received) = received {
            body["received"] = received;
        }
        Ok(body)
    }

    /// Start the pipeline exactly once per job; a repeated `final` is ignored
    /// rather than rejected so chunk replays stay harmless.
    async fn try_start(&self, state: &Arc<JobState>) -> Result<bool> {
        {
            let session = state.upload.lock().await;
            if !session.all_complete() {
                return Err(Error::UploadBadChunkMeta(format!(
                    "final received with {} file(s) incomplete",
                    session.pending_files()
                )));
            }
        }
        let input_dir = self.config.job_input_dir(&state.job_id);
        if list_images(&input_dir)?.is_empty() {
            return Err(Error::UploadNoSupportedFiles);
        }
        if state
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log_info(
                LogServiceType::Upload,
                format!("job {} already started, ignoring duplicate final", state.job_id),
            );
            return Ok(false);
        }
        self.spawn_pipeline(state.clone());
        Ok(true)
    }

    fn spawn_pipeline(&self, state: Arc<JobState>) {
        let mc = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = mc.pipeline_permits.clone().acquire_owned().await else {
                return;
            };
            let job_id = state.job_id.clone();
            let output_dir = mc.config.job_output_dir(&job_id);

            let progress_state = state.clone();
            let status_dir = output_dir.clone();
            let progress: ProgressFn = Arc::new(move |phase, fraction, counts| {
                let mut record = progress_state
                    .progress
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                record.advance(phase, fraction, counts);
                if let Err(err) = jobs::write_status(&status_dir, &record) {
                    log_error(LogServiceType::Pipeline, format!("status mirror failed: {}", err));
                }
            });

            let run = PipelineRun {
                job_id: job_id.clone(),
                input_dir: mc.config.job_input_dir(&job_id),
                output_dir: output_dir.clone(),
                engine: mc.engine.clone(),
                params: PipelineParams {
                    topk: mc.config.topk,
                    min_cluster_size: mc.config.min_cluster_size,
                    min_samples: mc.config.min_samples,
                    link_originals: mc.config.link_originals,
                },
                progress,
            };

            if let Err(err) = run_pipeline(run).await {
                log_error(LogServiceType::Pipeline, format!("job {} failed: {}", job_id, err));
                let mut record = state
                    .progress
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                record.fail(err.to_string());
                if let Err(err) = jobs::write_status(&output_dir, &record) {
                    log_error(LogServiceType::Pipeline, format!("status mirror failed: {}", err));
                }
            }
        });
    }

    /// Read-only progress poll; falls back to the on-disk mirror so a
    /// restarted server still answers for persisted jobs. A job the server
    /// has never seen polls as queued, so clients may start polling before
    /// the first chunk lands.
    pub async fn progress(&self, job_id: &str) -> Result<Value> {
        if let Some(state) = self.job(job_id).await {
            return Ok(serde_json::to_value(state.progress_snapshot())?);
        }
        match jobs::read_status(&self.config.job_output_dir(job_id)) {
            Ok(snapshot) => Ok(serde_json::to_value(snapshot)?),
            Err(Error::JobNotFound(_)) => Ok(json!({
                "phase": "queued",
                "fraction": 0.0,
                "counts": JobCounts::default(),
            })),
            Err(err) => Err(err),
        }
    }

    /// Full clustering result, or NotReady while the pipeline still runs.
    pub async fn result(&self, job_id: &str) -> Result<Value> {
        let output_dir = self.config.job_output_dir(job_id);
        match Ledger::load(&output_dir) {
            Ok(ledger) => Ok(ledger.result_view(job_id)),
            Err(Error::FileNotFound(_)) => {
                if self.job(job_id).await.is_some() || output_dir.exists() {
                    Err(Error::NotReady(job_id.to_string()))
                } else {
                    Err(Error::JobNotFound(job_id.to_string()))
                }
            }
            Err(err) => Err(err),
        }
    }
}

// endregion: --- Upload & job lifecycle

// region:    --- Curation

impl ModelController {
    /// Run one mutation under the job's exclusive curation lock. The ledger
    /// is reloaded, mutated and swapped atomically; a failing mutation leaves
    /// the persisted state untouched. A mutation racing another one on the
    /// same job is rejected rather than queued, so callers see the conflict.
    /// Unknown job ids fail before touching the registry.
    async fn with_ledger<F>(&self, job_id: &str, mutate: F) -> Result<Value>
    where
        F: FnOnce(&mut Ledger) -> Result<()>,
    {
        let output_dir = self.config.job_output_dir(job_id);
        if !output_dir.join(LEDGER_FILE).exists() {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        let state = self.job_or_register(job_id).await;
        let _guard = state
            .curation
            .try_lock()
            .map_err(|_| Error::Conflict(format!("job {} is being curated", job_id)))?;
        let mut ledger = Ledger::load(&output_dir)?;
        mutate(&mut ledger)?;
        ledger.save(&output_dir)?;
        Ok(json!({ "ok": true }))
    }

    pub async fn rename_cluster(&self, job_id: &str, cluster_id: i64, name: &str) -> Result<Value> {
        self.with_ledger(job_id, |ledger| ledger.rename_cluster(cluster_id, name)).await
    }

    pub async fn delete_cluster(&self, job_id: &str, cluster_id: i64) -> Result<Value> {
        self.with_ledger(job_id, |ledger| ledger.delete_cluster(cluster_id)).await
    }

    pub async fn assign_face(&self, job_id: &str, path: &str, target: i64) -> Result<Value> {
        self.with_ledger(job_id, |ledger| ledger.assign(path, target)).await
    }

    pub async fn reorder_cluster(&self, job_id: &str, cluster_id: i64, order: Vec<String>) -> Result<Value> {
        self.with_ledger(job_id, |ledger| ledger.reorder(cluster_id, &order)).await
    }

    pub async fn delete_face(&self, job_id: &str, path: &str) -> Result<Value> {
        self.with_ledger(job_id, |ledger| ledger.delete_face(path)).await
    }

    /// Archive the referenced grouped photos; missing entries are skipped.
    pub async fn export(&self, job_id: &str, paths: Vec<String>) -> Result<Vec<u8>> {
        let output_dir = self.config.job_output_dir(job_id);
        if !output_dir.exists() {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        let state = self.job_or_register(job_id).await;
        let _guard = state
            .curation
            .try_lock()
            .map_err(|_| Error::Conflict(format!("job {} is being curated", job_id)))?;
        spawn_blocking(move || export::build_archive(&output_dir, &paths))
            .await
            .map_err(|err| Error::Storage(err.to_string()))?
    }

    /// Convert grouped symlinks to copies, then drop the stored originals.
    pub async fn delete_originals(&self, job_id: &str) -> Result<Value> {
        let input_dir = self.config.job_input_dir(job_id);
        let output_dir = self.config.job_output_dir(job_id);
        if !output_dir.exists() {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        let state = self.job_or_register(job_id).await;
        let _guard = state
            .curation
            .try_lock()
            .map_err(|_| Error::Conflict(format!("job {} is being curated", job_id)))?;
        let report = spawn_blocking(move || export::delete_originals(&input_dir, &output_dir))
            .await
            .map_err(|err| Error::Storage(err.to_string()))??;
        Ok(serde_json::to_value(report)?)
    }

    /// Wipe every job, input and output alike.
    pub async fn purge_all(&self) -> Result<Value> {
        let mut jobs = self.jobs.write().await;
        jobs.clear();
        let input_root = self.config.input_root.clone();
        let output_root = self.config.output_root.clone();
        let report = spawn_blocking(move || export::purge_all(&input_root, &output_root))
            .await
            .map_err(|err| Error::Storage(err.to_string()))??;
        log_info(LogServiceType::Ledger, "purged all stored data".to_string());
        Ok(serde_json::to_value(report)?)
    }
}

// endregion: --- Curation
