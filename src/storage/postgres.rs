use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::{Storage, StorageError, StorageResult};
use crate::db::Db;
use crate::job::{GenerationJob, JobStatus, JobUpdate};
use crate::models::{
    KbChunk, KbDocument, Lesson, LessonSection, Path, Question, Quiz, RetrievedChunk,
    SectionContent,
};
use crate::outline::{CourseOutline, StoredOutline};
use crate::text_enum::UnknownVariant;

pub struct PgStorage {
    db: Db,
}

impl PgStorage {
    pub fn new(db: Db) -> Self {
        PgStorage { db }
    }
}

fn malformed(entity: &'static str) -> impl Fn(UnknownVariant) -> StorageError {
    move |e| StorageError::Malformed {
        entity,
        message: e.to_string(),
    }
}

/// pgvector text literal, e.g. `[0.1,0.2]`.
fn vector_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

// --- rows ---

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    knowledge_base_id: Uuid,
    status: String,
    progress: i32,
    request: serde_json::Value,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = StorageError;

    fn try_from(r: JobRow) -> Result<Self, Self::Error> {
        Ok(GenerationJob {
            id: r.id,
            knowledge_base_id: r.knowledge_base_id,
            status: r.status.parse::<JobStatus>().map_err(malformed("job"))?,
            progress: r.progress,
            request: r.request,
            result: r.result,
            error_message: r.error_message,
            created_at: r.created_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutlineRow {
    id: Uuid,
    knowledge_base_id: Uuid,
    organization_id: Uuid,
    created_by: Uuid,
    outline: Json<CourseOutline>,
    created_at: DateTime<Utc>,
}

impl From<OutlineRow> for StoredOutline {
    fn from(r: OutlineRow) -> Self {
        StoredOutline {
            id: r.id,
            knowledge_base_id: r.knowledge_base_id,
            organization_id: r.organization_id,
            created_by: r.created_by,
            outline: r.outline.0,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PathRow {
    id: Uuid,
    outline_id: Uuid,
    organization_id: Uuid,
    title: String,
    description: String,
    order_index: i32,
    published: bool,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl From<PathRow> for Path {
    fn from(r: PathRow) -> Self {
        Path {
            id: r.id,
            outline_id: r.outline_id,
            organization_id: r.organization_id,
            title: r.title,
            description: r.description,
            order_index: r.order_index,
            published: r.published,
            created_by: r.created_by,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LessonRow {
    id: Uuid,
    path_id: Uuid,
    title: String,
    description: String,
    order_index: i32,
    estimated_duration_hours: f32,
    content_type: String,
    learning_objectives: Vec<String>,
    source_references: Vec<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LessonRow> for Lesson {
    type Error = StorageError;

    fn try_from(r: LessonRow) -> Result<Self, Self::Error> {
        Ok(Lesson {
            id: r.id,
            path_id: r.path_id,
            title: r.title,
            description: r.description,
            order_index: r.order_index,
            estimated_duration_hours: r.estimated_duration_hours,
            content_type: r.content_type.parse().map_err(malformed("lesson"))?,
            learning_objectives: r.learning_objectives,
            source_references: r.source_references,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SectionRow {
    id: Uuid,
    lesson_id: Uuid,
    title: String,
    content: Json<SectionContent>,
    section_type: String,
    order_index: i32,
    provenance: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<SectionRow> for LessonSection {
    type Error = StorageError;

    fn try_from(r: SectionRow) -> Result<Self, Self::Error> {
        Ok(LessonSection {
            id: r.id,
            lesson_id: r.lesson_id,
            title: r.title,
            content: r.content.0,
            section_type: r.section_type.parse().map_err(malformed("lesson_section"))?,
            order_index: r.order_index,
            provenance: r.provenance.parse().map_err(malformed("lesson_section"))?,
            created_by: r.created_by,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    id: Uuid,
    lesson_id: Option<Uuid>,
    quiz_id: Option<Uuid>,
    question_text: String,
    question_type: String,
    options: Vec<String>,
    correct_answer: String,
    explanation: Option<String>,
    points: i32,
    difficulty: String,
    learning_objectives: Vec<String>,
    provenance: String,
    order_index: i32,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<QuestionRow> for Question {
    type Error = StorageError;

    fn try_from(r: QuestionRow) -> Result<Self, Self::Error> {
        Ok(Question {
            id: r.id,
            lesson_id: r.lesson_id,
            quiz_id: r.quiz_id,
            question_text: r.question_text,
            question_type: r.question_type.parse().map_err(malformed("question"))?,
            options: r.options,
            correct_answer: r.correct_answer,
            explanation: r.explanation,
            points: r.points,
            difficulty: r.difficulty.parse().map_err(malformed("question"))?,
            learning_objectives: r.learning_objectives,
            provenance: r.provenance.parse().map_err(malformed("question"))?,
            order_index: r.order_index,
            created_by: r.created_by,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QuizRow {
    id: Uuid,
    outline_id: Uuid,
    path_id: Option<Uuid>,
    title: String,
    description: String,
    assessment_type: String,
    time_limit_minutes: i32,
    passing_score_percentage: i32,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<QuizRow> for Quiz {
    type Error = StorageError;

    fn try_from(r: QuizRow) -> Result<Self, Self::Error> {
        Ok(Quiz {
            id: r.id,
            outline_id: r.outline_id,
            path_id: r.path_id,
            title: r.title,
            description: r.description,
            assessment_type: r.assessment_type.parse().map_err(malformed("quiz"))?,
            time_limit_minutes: r.time_limit_minutes,
            passing_score_percentage: r.passing_score_percentage,
            created_by: r.created_by,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    knowledge_base_id: Uuid,
    file_name: String,
    summary: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: Uuid,
    document_id: Uuid,
    chunk_index: i32,
    content: String,
}

#[derive(sqlx::FromRow)]
struct MatchRow {
    id: Uuid,
    document_id: Uuid,
    content: String,
    similarity: f64,
}

fn collect<R, T>(rows: Vec<R>) -> StorageResult<Vec<T>>
where
    T: TryFrom<R, Error = StorageError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl Storage for PgStorage {
    async fn insert_job(&self, job: &GenerationJob) -> StorageResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO generation_jobs
                (id, knowledge_base_id, status, progress, request, result, error_message,
                 created_at, started_at, completed_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(job.knowledge_base_id)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(&job.request)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .fetch_one(&self.db)
        .await?;
        Ok(id)
    }

    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> StorageResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE generation_jobs SET
                status        = COALESCE($2, status),
                progress      = COALESCE($3, progress),
                error_message = COALESCE($4, error_message),
                result        = COALESCE($5, result),
                started_at    = COALESCE($6, started_at),
                completed_at  = COALESCE($7, completed_at),
                updated_at    = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.progress)
        .bind(&update.error_message)
        .bind(&update.result)
        .bind(update.started_at)
        .bind(update.completed_at)
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound { entity: "job", id });
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StorageResult<Option<GenerationJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT id, knowledge_base_id, status, progress, request, result, error_message,
                   created_at, started_at, completed_at
            FROM generation_jobs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(GenerationJob::try_from).transpose()
    }

    async fn insert_outline(&self, outline: &StoredOutline) -> StorageResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO course_outlines
                (id, knowledge_base_id, organization_id, created_by, title, status, outline, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            RETURNING id
            "#,
        )
        .bind(outline.id)
        .bind(outline.knowledge_base_id)
        .bind(outline.organization_id)
        .bind(outline.created_by)
        .bind(&outline.outline.title)
        .bind(outline.outline.status.as_str())
        .bind(Json(&outline.outline))
        .bind(outline.created_at)
        .fetch_one(&self.db)
        .await?;
        Ok(id)
    }

    async fn get_outline(&self, id: Uuid) -> StorageResult<Option<StoredOutline>> {
        let row: Option<OutlineRow> = sqlx::query_as(
            r#"
            SELECT id, knowledge_base_id, organization_id, created_by, outline, created_at
            FROM course_outlines WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(StoredOutline::from))
    }

    async fn insert_path(&self, path: &Path) -> StorageResult<Path> {
        let row: PathRow = sqlx::query_as(
            r#"
            INSERT INTO paths
                (id, outline_id, organization_id, title, description, order_index, published,
                 created_by, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            RETURNING id, outline_id, organization_id, title, description, order_index,
                      published, created_by, created_at
            "#,
        )
        .bind(path.id)
        .bind(path.outline_id)
        .bind(path.organization_id)
        .bind(&path.title)
        .bind(&path.description)
        .bind(path.order_index)
        .bind(path.published)
        .bind(path.created_by)
        .bind(path.created_at)
        .fetch_one(&self.db)
        .await?;
        Ok(row.into())
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> StorageResult<Lesson> {
        let row: LessonRow = sqlx::query_as(
            r#"
            INSERT INTO lessons
                (id, path_id, title, description, order_index, estimated_duration_hours,
                 content_type, learning_objectives, source_references, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            RETURNING id, path_id, title, description, order_index, estimated_duration_hours,
                      content_type, learning_objectives, source_references, created_at
            "#,
        )
        .bind(lesson.id)
        .bind(lesson.path_id)
        .bind(&lesson.title)
        .bind(&lesson.description)
        .bind(lesson.order_index)
        .bind(lesson.estimated_duration_hours)
        .bind(lesson.content_type.as_str())
        .bind(&lesson.learning_objectives)
        .bind(&lesson.source_references)
        .bind(lesson.created_at)
        .fetch_one(&self.db)
        .await?;
        row.try_into()
    }

    async fn insert_section(&self, section: &LessonSection) -> StorageResult<LessonSection> {
        let row: SectionRow = sqlx::query_as(
            r#"
            INSERT INTO lesson_sections
                (id, lesson_id, title, content, section_type, order_index, provenance,
                 created_by, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            RETURNING id, lesson_id, title, content, section_type, order_index, provenance,
                      created_by, created_at
            "#,
        )
        .bind(section.id)
        .bind(section.lesson_id)
        .bind(&section.title)
        .bind(Json(&section.content))
        .bind(section.section_type.as_str())
        .bind(section.order_index)
        .bind(section.provenance.as_str())
        .bind(section.created_by)
        .bind(section.created_at)
        .fetch_one(&self.db)
        .await?;
        row.try_into()
    }

    async fn insert_question(&self, q: &Question) -> StorageResult<Question> {
        let row: QuestionRow = sqlx::query_as(
            r#"
            INSERT INTO questions
                (id, lesson_id, quiz_id, question_text, question_type, options, correct_answer,
                 explanation, points, difficulty, learning_objectives, provenance, order_index,
                 created_by, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            RETURNING id, lesson_id, quiz_id, question_text, question_type, options,
                      correct_answer, explanation, points, difficulty, learning_objectives,
                      provenance, order_index, created_by, created_at
            "#,
        )
        .bind(q.id)
        .bind(q.lesson_id)
        .bind(q.quiz_id)
        .bind(&q.question_text)
        .bind(q.question_type.as_str())
        .bind(&q.options)
        .bind(&q.correct_answer)
        .bind(&q.explanation)
        .bind(q.points)
        .bind(q.difficulty.as_str())
        .bind(&q.learning_objectives)
        .bind(q.provenance.as_str())
        .bind(q.order_index)
        .bind(q.created_by)
        .bind(q.created_at)
        .fetch_one(&self.db)
        .await?;
        row.try_into()
    }

    async fn insert_quiz(&self, quiz: &Quiz) -> StorageResult<Quiz> {
        let row: QuizRow = sqlx::query_as(
            r#"
            INSERT INTO quizzes
                (id, outline_id, path_id, title, description, assessment_type,
                 time_limit_minutes, passing_score_percentage, created_by, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            RETURNING id, outline_id, path_id, title, description, assessment_type,
                      time_limit_minutes, passing_score_percentage, created_by, created_at
            "#,
        )
        .bind(quiz.id)
        .bind(quiz.outline_id)
        .bind(quiz.path_id)
        .bind(&quiz.title)
        .bind(&quiz.description)
        .bind(quiz.assessment_type.as_str())
        .bind(quiz.time_limit_minutes)
        .bind(quiz.passing_score_percentage)
        .bind(quiz.created_by)
        .bind(quiz.created_at)
        .fetch_one(&self.db)
        .await?;
        row.try_into()
    }

    async fn list_paths(&self, outline_id: Uuid) -> StorageResult<Vec<Path>> {
        let rows: Vec<PathRow> = sqlx::query_as(
            r#"
            SELECT id, outline_id, organization_id, title, description, order_index,
                   published, created_by, created_at
            FROM paths WHERE outline_id = $1 ORDER BY order_index
            "#,
        )
        .bind(outline_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Path::from).collect())
    }

    async fn list_lessons(&self, path_id: Uuid) -> StorageResult<Vec<Lesson>> {
        let rows: Vec<LessonRow> = sqlx::query_as(
            r#"
            SELECT id, path_id, title, description, order_index, estimated_duration_hours,
                   content_type, learning_objectives, source_references, created_at
            FROM lessons WHERE path_id = $1 ORDER BY order_index
            "#,
        )
        .bind(path_id)
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn list_sections(&self, lesson_id: Uuid) -> StorageResult<Vec<LessonSection>> {
        let rows: Vec<SectionRow> = sqlx::query_as(
            r#"
            SELECT id, lesson_id, title, content, section_type, order_index, provenance,
                   created_by, created_at
            FROM lesson_sections WHERE lesson_id = $1 ORDER BY order_index ASC
            "#,
        )
        .bind(lesson_id)
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn list_questions_for_lesson(&self, lesson_id: Uuid) -> StorageResult<Vec<Question>> {
        let rows: Vec<QuestionRow> = sqlx::query_as(
            r#"
            SELECT id, lesson_id, quiz_id, question_text, question_type, options,
                   correct_answer, explanation, points, difficulty, learning_objectives,
                   provenance, order_index, created_by, created_at
            FROM questions WHERE lesson_id = $1 ORDER BY order_index
            "#,
        )
        .bind(lesson_id)
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn list_questions_for_quiz(&self, quiz_id: Uuid) -> StorageResult<Vec<Question>> {
        let rows: Vec<QuestionRow> = sqlx::query_as(
            r#"
            SELECT id, lesson_id, quiz_id, question_text, question_type, options,
                   correct_answer, explanation, points, difficulty, learning_objectives,
                   provenance, order_index, created_by, created_at
            FROM questions WHERE quiz_id = $1 ORDER BY order_index
            "#,
        )
        .bind(quiz_id)
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn list_quizzes(&self, outline_id: Uuid) -> StorageResult<Vec<Quiz>> {
        let rows: Vec<QuizRow> = sqlx::query_as(
            r#"
            SELECT id, outline_id, path_id, title, description, assessment_type,
                   time_limit_minutes, passing_score_percentage, created_by, created_at
            FROM quizzes WHERE outline_id = $1 ORDER BY created_at
            "#,
        )
        .bind(outline_id)
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn list_documents(&self, knowledge_base_id: Uuid) -> StorageResult<Vec<KbDocument>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT id, knowledge_base_id, file_name, summary, status, created_at
            FROM kb_documents
            WHERE knowledge_base_id = $1 AND status = 'completed'
            ORDER BY created_at
            "#,
        )
        .bind(knowledge_base_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| KbDocument {
                id: r.id,
                knowledge_base_id: r.knowledge_base_id,
                file_name: r.file_name,
                summary: r.summary,
                status: r.status,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn count_chunks(&self, document_id: Uuid) -> StorageResult<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kb_chunks WHERE document_id = $1")
            .bind(document_id)
            .fetch_one(&self.db)
            .await?;
        Ok(n.max(0) as usize)
    }

    async fn list_chunks(
        &self,
        knowledge_base_id: Uuid,
        limit: usize,
    ) -> StorageResult<Vec<KbChunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.content
            FROM kb_chunks c
            JOIN kb_documents d ON d.id = c.document_id
            WHERE d.knowledge_base_id = $1 AND d.status = 'completed'
            ORDER BY c.document_id, c.chunk_index
            LIMIT $2
            "#,
        )
        .bind(knowledge_base_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| KbChunk {
                id: r.id,
                document_id: r.document_id,
                chunk_index: r.chunk_index,
                content: r.content,
            })
            .collect())
    }

    async fn first_chunks(&self, document_ids: &[Uuid]) -> StorageResult<Vec<KbChunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (document_id) id, document_id, chunk_index, content
            FROM kb_chunks
            WHERE document_id = ANY($1)
            ORDER BY document_id, chunk_index
            "#,
        )
        .bind(document_ids)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| KbChunk {
                id: r.id,
                document_id: r.document_id,
                chunk_index: r.chunk_index,
                content: r.content,
            })
            .collect())
    }

    async fn match_chunks(
        &self,
        knowledge_base_id: Uuid,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> StorageResult<Vec<RetrievedChunk>> {
        let rows: Vec<MatchRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.document_id, c.content,
                   (1 - (c.embedding <=> $2::text::vector))::float8 AS similarity
            FROM kb_chunks c
            JOIN kb_documents d ON d.id = c.document_id
            WHERE d.knowledge_base_id = $1
              AND d.status = 'completed'
              AND c.embedding IS NOT NULL
              AND 1 - (c.embedding <=> $2::text::vector) >= $3
            ORDER BY c.embedding <=> $2::text::vector
            LIMIT $4
            "#,
        )
        .bind(knowledge_base_id)
        .bind(vector_literal(embedding))
        .bind(threshold)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| RetrievedChunk {
                id: r.id,
                document_id: r.document_id,
                content: r.content,
                similarity: r.similarity,
            })
            .collect())
    }
}
