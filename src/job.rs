//! Generation job state machine.
//!
//! queued → processing → {completed | failed}. Terminal states are final, and
//! progress only moves forward while processing. `JobTracker` is the single
//! writer for one job: it serializes every persisted update behind a mutex so
//! stored progress can never go backwards, even when checkpoints race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::storage::{Storage, StorageError};

text_enum! {
    pub enum JobStatus {
        Queued => "queued",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                // a job that never got to start can still be failed (spawn
                // failure, cancellation before the first stage)
                | (JobStatus::Queued, JobStatus::Failed)
        )
    }
}

/// Fixed progress checkpoints, written after each pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProgressStage {
    AnalysisComplete,
    ContentSampled,
    OutlineGenerated,
    OutlinePersisted,
    LessonsMaterialized,
    AssessmentsMaterialized,
    Finalizing,
    Completed,
}

impl ProgressStage {
    pub fn percent(&self) -> i32 {
        match self {
            ProgressStage::AnalysisComplete => 15,
            ProgressStage::ContentSampled => 25,
            ProgressStage::OutlineGenerated => 45,
            ProgressStage::OutlinePersisted => 55,
            ProgressStage::LessonsMaterialized => 70,
            ProgressStage::AssessmentsMaterialized => 85,
            ProgressStage::Finalizing => 95,
            ProgressStage::Completed => 100,
        }
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("illegal job transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
    #[error("job already {0}; no further updates accepted")]
    Finished(JobStatus),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GenerationJob {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub status: JobStatus,
    pub progress: i32,
    pub request: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial update persisted by `Storage::update_job`. `None` leaves a column
/// untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<i32>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn apply_to(&self, job: &mut GenerationJob) {
        if let Some(s) = self.status {
            job.status = s;
        }
        if let Some(p) = self.progress {
            job.progress = p;
        }
        if let Some(e) = &self.error_message {
            job.error_message = Some(e.clone());
        }
        if let Some(r) = &self.result {
            job.result = Some(r.clone());
        }
        if let Some(t) = self.started_at {
            job.started_at = Some(t);
        }
        if let Some(t) = self.completed_at {
            job.completed_at = Some(t);
        }
    }
}

impl GenerationJob {
    pub fn new(knowledge_base_id: Uuid, request: serde_json::Value) -> Self {
        GenerationJob {
            id: Uuid::new_v4(),
            knowledge_base_id,
            status: JobStatus::Queued,
            progress: 0,
            request,
            result: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves to `to`, stamping timestamps, and returns the update to persist.
    pub fn transition(&mut self, to: JobStatus) -> Result<JobUpdate, JobError> {
        if self.status.is_terminal() {
            return Err(JobError::Finished(self.status));
        }
        if !self.status.can_transition_to(to) {
            return Err(JobError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        let mut update = JobUpdate {
            status: Some(to),
            ..Default::default()
        };
        match to {
            JobStatus::Processing => update.started_at = Some(now),
            JobStatus::Completed => {
                update.completed_at = Some(now);
                update.progress = Some(100);
            }
            JobStatus::Failed => update.completed_at = Some(now),
            JobStatus::Queued => {}
        }
        update.apply_to(self);
        Ok(update)
    }

    /// Raises progress while processing. Returns `None` when the value would
    /// not move progress forward.
    pub fn advance(&mut self, progress: i32) -> Result<Option<JobUpdate>, JobError> {
        if self.status.is_terminal() {
            return Err(JobError::Finished(self.status));
        }
        if self.status != JobStatus::Processing {
            return Err(JobError::IllegalTransition {
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        let progress = progress.clamp(0, 100);
        if progress <= self.progress {
            return Ok(None);
        }
        let update = JobUpdate {
            progress: Some(progress),
            ..Default::default()
        };
        update.apply_to(self);
        Ok(Some(update))
    }
}

/// Owns one job for the duration of a pipeline run and persists every change.
pub struct JobTracker {
    storage: Arc<dyn Storage>,
    job: Mutex<GenerationJob>,
}

impl JobTracker {
    pub fn new(storage: Arc<dyn Storage>, job: GenerationJob) -> Self {
        JobTracker {
            storage,
            job: Mutex::new(job),
        }
    }

    pub async fn job_id(&self) -> Uuid {
        self.job.lock().await.id
    }

    pub async fn snapshot(&self) -> GenerationJob {
        self.job.lock().await.clone()
    }

    pub async fn start(&self) -> Result<(), JobError> {
        let mut job = self.job.lock().await;
        let update = job.transition(JobStatus::Processing)?;
        self.storage.update_job(job.id, &update).await?;
        tracing::info!(job_id = %job.id, "generation job processing");
        Ok(())
    }

    pub async fn checkpoint(&self, stage: ProgressStage) -> Result<(), JobError> {
        let mut job = self.job.lock().await;
        if let Some(update) = job.advance(stage.percent())? {
            self.storage.update_job(job.id, &update).await?;
            tracing::debug!(job_id = %job.id, ?stage, progress = job.progress, "checkpoint");
        }
        Ok(())
    }

    pub async fn complete(&self, result: serde_json::Value) -> Result<(), JobError> {
        let mut job = self.job.lock().await;
        let mut update = job.transition(JobStatus::Completed)?;
        update.result = Some(result.clone());
        job.result = Some(result);
        self.storage.update_job(job.id, &update).await?;
        tracing::info!(job_id = %job.id, "generation job completed");
        Ok(())
    }

    pub async fn fail(&self, message: impl Into<String>) -> Result<(), JobError> {
        let message = message.into();
        let mut job = self.job.lock().await;
        let mut update = job.transition(JobStatus::Failed)?;
        update.error_message = Some(message.clone());
        job.error_message = Some(message.clone());
        self.storage.update_job(job.id, &update).await?;
        tracing::warn!(job_id = %job.id, error = %message, "generation job failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn job() -> GenerationJob {
        GenerationJob::new(Uuid::new_v4(), serde_json::json!({}))
    }

    #[test]
    fn legal_path_to_completion() {
        let mut j = job();
        j.transition(JobStatus::Processing).unwrap();
        assert!(j.started_at.is_some());
        let u = j.transition(JobStatus::Completed).unwrap();
        assert_eq!(u.progress, Some(100));
        assert!(j.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut j = job();
        j.transition(JobStatus::Processing).unwrap();
        j.transition(JobStatus::Failed).unwrap();
        assert!(matches!(
            j.transition(JobStatus::Completed),
            Err(JobError::Finished(JobStatus::Failed))
        ));
        assert!(matches!(j.advance(90), Err(JobError::Finished(_))));
    }

    #[test]
    fn cannot_skip_processing_to_complete() {
        let mut j = job();
        assert!(matches!(
            j.transition(JobStatus::Completed),
            Err(JobError::IllegalTransition { .. })
        ));
        assert!(j.advance(10).is_err());
    }

    #[test]
    fn progress_never_decreases() {
        let mut j = job();
        j.transition(JobStatus::Processing).unwrap();
        assert!(j.advance(45).unwrap().is_some());
        assert!(j.advance(25).unwrap().is_none());
        assert!(j.advance(45).unwrap().is_none());
        assert_eq!(j.progress, 45);
        assert_eq!(j.advance(250).unwrap().unwrap().progress, Some(100));
    }

    #[test]
    fn checkpoints_are_strictly_increasing() {
        let stages = [
            ProgressStage::AnalysisComplete,
            ProgressStage::ContentSampled,
            ProgressStage::OutlineGenerated,
            ProgressStage::OutlinePersisted,
            ProgressStage::LessonsMaterialized,
            ProgressStage::AssessmentsMaterialized,
            ProgressStage::Finalizing,
            ProgressStage::Completed,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].percent() < pair[1].percent());
        }
    }

    #[tokio::test]
    async fn tracker_persists_each_step() {
        let storage = Arc::new(MemoryStorage::new());
        let j = job();
        let id = j.id;
        storage.insert_job(&j).await.unwrap();
        let tracker = JobTracker::new(storage.clone(), j);

        tracker.start().await.unwrap();
        tracker.checkpoint(ProgressStage::OutlineGenerated).await.unwrap();
        tracker.checkpoint(ProgressStage::AnalysisComplete).await.unwrap();
        let stored = storage.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.progress, 45);

        tracker.fail("outline parse failed").await.unwrap();
        let stored = storage.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("outline parse failed"));
        assert!(tracker.complete(serde_json::json!({})).await.is_err());
    }
}
