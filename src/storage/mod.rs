//! Storage collaborator: plain create/read/update operations with no
//! multi-statement transactions. Callers tolerate partial writes.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{GenerationJob, JobUpdate};
use crate::models::{
    KbChunk, KbDocument, Lesson, LessonSection, Path, Question, Quiz, RetrievedChunk,
};
use crate::outline::StoredOutline;

pub mod memory;
pub mod postgres;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("malformed {entity} row: {message}")]
    Malformed {
        entity: &'static str,
        message: String,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    // jobs
    async fn insert_job(&self, job: &GenerationJob) -> StorageResult<Uuid>;
    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> StorageResult<()>;
    async fn get_job(&self, id: Uuid) -> StorageResult<Option<GenerationJob>>;

    // outlines
    async fn insert_outline(&self, outline: &StoredOutline) -> StorageResult<Uuid>;
    async fn get_outline(&self, id: Uuid) -> StorageResult<Option<StoredOutline>>;

    // materialized entities
    async fn insert_path(&self, path: &Path) -> StorageResult<Path>;
    async fn insert_lesson(&self, lesson: &Lesson) -> StorageResult<Lesson>;
    async fn insert_section(&self, section: &LessonSection) -> StorageResult<LessonSection>;
    async fn insert_question(&self, question: &Question) -> StorageResult<Question>;
    async fn insert_quiz(&self, quiz: &Quiz) -> StorageResult<Quiz>;

    async fn list_paths(&self, outline_id: Uuid) -> StorageResult<Vec<Path>>;
    async fn list_lessons(&self, path_id: Uuid) -> StorageResult<Vec<Lesson>>;
    /// Sections of one lesson, ascending by `order_index`.
    async fn list_sections(&self, lesson_id: Uuid) -> StorageResult<Vec<LessonSection>>;
    async fn list_questions_for_lesson(&self, lesson_id: Uuid) -> StorageResult<Vec<Question>>;
    async fn list_questions_for_quiz(&self, quiz_id: Uuid) -> StorageResult<Vec<Question>>;
    async fn list_quizzes(&self, outline_id: Uuid) -> StorageResult<Vec<Quiz>>;

    // knowledge base
    async fn list_documents(&self, knowledge_base_id: Uuid) -> StorageResult<Vec<KbDocument>>;
    async fn count_chunks(&self, document_id: Uuid) -> StorageResult<usize>;
    /// Arbitrary sample of chunks from completed documents, used when vector
    /// search has nothing to offer.
    async fn list_chunks(&self, knowledge_base_id: Uuid, limit: usize)
        -> StorageResult<Vec<KbChunk>>;
    /// The lowest-index chunk of each listed document. Documents without
    /// chunks are absent from the result.
    async fn first_chunks(&self, document_ids: &[Uuid]) -> StorageResult<Vec<KbChunk>>;
    /// Vector search: chunks with cosine similarity >= `threshold`, best first.
    async fn match_chunks(
        &self,
        knowledge_base_id: Uuid,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> StorageResult<Vec<RetrievedChunk>>;
}
