//! Job driver: analysis → content sample → outline → persisted outline →
//! materialization → completion.
//!
//! `generate_course` returns as soon as the queued job is stored. The stages
//! run in a spawned task wrapped in `catch_unwind` and a job-level timeout,
//! and every exit path ends in `JobTracker::complete` or `JobTracker::fail`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::analyzer::KnowledgeBaseAnalyzer;
use crate::cache::KbContentCache;
use crate::engine::ContentEngine;
use crate::error::GenerationError;
use crate::job::{GenerationJob, JobTracker, ProgressStage};
use crate::materializer::LmsEntityMaterializer;
use crate::models::CourseGenerationRequest;
use crate::outline::StoredOutline;
use crate::outline_generator::{CourseOutlineGenerator, OutlineError};
use crate::provider::ModelProvider;
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub lesson_batch_size: usize,
    pub job_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            lesson_batch_size: 2,
            job_timeout: Duration::from_secs(3600),
        }
    }
}

/// A started job. Dropping the handle does not stop the job.
pub struct JobHandle {
    pub job: GenerationJob,
    task: JoinHandle<GenerationJob>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// Waits for the job to reach a terminal state and returns its final
    /// record.
    pub async fn wait(self) -> Result<GenerationJob, GenerationError> {
        self.task
            .await
            .map_err(|e| GenerationError::Panicked(e.to_string()))
    }
}

#[derive(Clone)]
pub struct CourseGenerator {
    storage: Arc<dyn Storage>,
    analyzer: KnowledgeBaseAnalyzer,
    outlines: CourseOutlineGenerator,
    materializer: LmsEntityMaterializer,
    job_timeout: Duration,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CourseGenerator {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn ModelProvider>,
        settings: PipelineSettings,
    ) -> Self {
        let engine = ContentEngine::new(provider);
        let analyzer = KnowledgeBaseAnalyzer::new(storage.clone(), engine.clone());
        CourseGenerator {
            outlines: CourseOutlineGenerator::new(analyzer.clone(), engine.clone()),
            materializer: LmsEntityMaterializer::new(
                storage.clone(),
                engine,
                analyzer.clone(),
                settings.lesson_batch_size,
            ),
            analyzer,
            storage,
            job_timeout: settings.job_timeout,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Validates the request, stores a queued job and starts it in the
    /// background.
    pub async fn generate_course(
        &self,
        request: CourseGenerationRequest,
    ) -> Result<JobHandle, GenerationError> {
        request.validate().map_err(GenerationError::InvalidRequest)?;
        let snapshot = serde_json::to_value(&request)
            .map_err(|e| GenerationError::InvalidRequest(e.to_string()))?;
        let job = GenerationJob::new(request.knowledge_base_id, snapshot);
        self.storage.insert_job(&job).await?;

        let cancel = CancellationToken::new();
        self.registry().insert(job.id, cancel.clone());
        tracing::info!(
            job_id = %job.id,
            kb = %request.knowledge_base_id,
            title = %request.title,
            "generation job queued"
        );

        let tracker = JobTracker::new(self.storage.clone(), job.clone());
        let span = tracing::info_span!("generation_job", job_id = %job.id);
        let this = self.clone();
        let task = tokio::spawn(
            async move { this.supervise(tracker, request, cancel).await }.instrument(span),
        );
        Ok(JobHandle { job, task })
    }

    /// Trips the job's cancellation token. False when the job is not running
    /// in this process.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.registry().get(&job_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(job_id = %job_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.registry().contains_key(&job_id)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn supervise(
        self,
        tracker: JobTracker,
        request: CourseGenerationRequest,
        cancel: CancellationToken,
    ) -> GenerationJob {
        let job_id = tracker.job_id().await;
        let run = AssertUnwindSafe(self.run(&tracker, &request, &cancel)).catch_unwind();
        let outcome = match tokio::time::timeout(self.job_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(GenerationError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => {
                cancel.cancel();
                Err(GenerationError::TimedOut(self.job_timeout.as_secs()))
            }
        };

        match outcome {
            Ok(result) => {
                if let Err(e) = tracker.complete(result).await {
                    tracing::error!(
                        job_id = %job_id,
                        error = %e,
                        "could not record job completion"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "generation job stopped");
                if let Err(fe) = tracker.fail(e.to_string()).await {
                    tracing::error!(job_id = %job_id, error = %fe, "could not record job failure");
                }
            }
        }
        self.registry().remove(&job_id);
        tracker.snapshot().await
    }

    async fn run(
        &self,
        tracker: &JobTracker,
        request: &CourseGenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, GenerationError> {
        tracker.start().await?;
        let mut cache = KbContentCache::new();
        let result = self.run_stages(tracker, request, cancel, &mut cache).await;
        cache.clear();
        result
    }

    async fn run_stages(
        &self,
        tracker: &JobTracker,
        request: &CourseGenerationRequest,
        cancel: &CancellationToken,
        cache: &mut KbContentCache,
    ) -> Result<serde_json::Value, GenerationError> {
        let kb = request.knowledge_base_id;

        let analysis = self
            .analyzer
            .analyze_knowledge_base(kb)
            .await
            .map_err(GenerationError::Analysis)?;
        let mode = request
            .generation_mode
            .unwrap_or(analysis.recommended_generation_mode);
        tracker.checkpoint(ProgressStage::AnalysisComplete).await?;
        ensure_running(cancel)?;

        let sample = self
            .outlines
            .sample_content(request, mode)
            .await
            .map_err(OutlineError::Sampling)?;
        tracker.checkpoint(ProgressStage::ContentSampled).await?;
        ensure_running(cancel)?;

        let outline = self
            .outlines
            .generate_from_sample(request, &analysis, mode, &sample)
            .await?;
        tracker.checkpoint(ProgressStage::OutlineGenerated).await?;
        ensure_running(cancel)?;

        let stored = StoredOutline {
            id: Uuid::new_v4(),
            knowledge_base_id: kb,
            organization_id: request.organization_id,
            created_by: request.user_id,
            outline,
            created_at: Utc::now(),
        };
        let outline_id = self
            .storage
            .insert_outline(&stored)
            .await
            .map_err(GenerationError::OutlinePersistence)?;
        tracker.checkpoint(ProgressStage::OutlinePersisted).await?;
        tracing::info!(
            outline_id = %outline_id,
            %mode,
            lessons = stored.outline.lesson_count(),
            "outline stored"
        );
        ensure_running(cancel)?;

        let report = self
            .materializer
            .create_lms_entities(outline_id, &stored.outline, request, cache, tracker, cancel)
            .await?;
        tracker.checkpoint(ProgressStage::Finalizing).await?;

        Ok(serde_json::json!({
            "outline_id": outline_id,
            "generation_mode": mode,
            "report": report,
        }))
    }
}

fn ensure_running(cancel: &CancellationToken) -> Result<(), GenerationError> {
    if cancel.is_cancelled() {
        Err(GenerationError::Cancelled)
    } else {
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn cancelled_token_stops_the_run() {
        let token = CancellationToken::new();
        assert!(ensure_running(&token).is_ok());
        token.cancel();
        assert!(matches!(ensure_running(&token), Err(GenerationError::Cancelled)));
    }
}
