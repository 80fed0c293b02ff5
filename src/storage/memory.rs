//! In-process storage. Backs the service when no `DATABASE_URL` is set and
//! serves as the storage double in tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Storage, StorageError, StorageResult};
use crate::job::{GenerationJob, JobUpdate};
use crate::models::{
    KbChunk, KbDocument, Lesson, LessonSection, Path, Question, Quiz, RetrievedChunk,
};
use crate::outline::StoredOutline;

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, GenerationJob>,
    job_history: HashMap<Uuid, Vec<GenerationJob>>,
    outlines: HashMap<Uuid, StoredOutline>,
    paths: Vec<Path>,
    lessons: Vec<Lesson>,
    sections: Vec<LessonSection>,
    questions: Vec<Question>,
    quizzes: Vec<Quiz>,
    documents: Vec<KbDocument>,
    chunks: Vec<(KbChunk, Option<Vec<f32>>)>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&self, doc: KbDocument) {
        self.write().documents.push(doc);
    }

    pub fn add_chunk(&self, chunk: KbChunk, embedding: Option<Vec<f32>>) {
        self.write().chunks.push((chunk, embedding));
    }

    /// Every persisted state of a job, oldest first.
    pub fn job_history(&self, id: Uuid) -> Vec<GenerationJob> {
        self.read().job_history.get(&id).cloned().unwrap_or_default()
    }

    pub fn all_paths(&self) -> Vec<Path> {
        self.read().paths.clone()
    }

    pub fn all_lessons(&self) -> Vec<Lesson> {
        self.read().lessons.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_job(&self, job: &GenerationJob) -> StorageResult<Uuid> {
        let mut t = self.write();
        t.jobs.insert(job.id, job.clone());
        t.job_history.entry(job.id).or_default().push(job.clone());
        Ok(job.id)
    }

    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> StorageResult<()> {
        let mut t = self.write();
        let job = t
            .jobs
            .get_mut(&id)
            .ok_or(StorageError::NotFound { entity: "job", id })?;
        update.apply_to(job);
        let snapshot = job.clone();
        t.job_history.entry(id).or_default().push(snapshot);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StorageResult<Option<GenerationJob>> {
        Ok(self.read().jobs.get(&id).cloned())
    }

    async fn insert_outline(&self, outline: &StoredOutline) -> StorageResult<Uuid> {
        self.write().outlines.insert(outline.id, outline.clone());
        Ok(outline.id)
    }

    async fn get_outline(&self, id: Uuid) -> StorageResult<Option<StoredOutline>> {
        Ok(self.read().outlines.get(&id).cloned())
    }

    async fn insert_path(&self, path: &Path) -> StorageResult<Path> {
        self.write().paths.push(path.clone());
        Ok(path.clone())
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> StorageResult<Lesson> {
        self.write().lessons.push(lesson.clone());
        Ok(lesson.clone())
    }

    async fn insert_section(&self, section: &LessonSection) -> StorageResult<LessonSection> {
        let mut t = self.write();
        let clash = t
            .sections
            .iter()
            .any(|s| s.lesson_id == section.lesson_id && s.order_index == section.order_index);
        if clash {
            return Err(StorageError::Malformed {
                entity: "lesson_section",
                message: format!(
                    "duplicate order_index {} for lesson {}",
                    section.order_index, section.lesson_id
                ),
            });
        }
        t.sections.push(section.clone());
        Ok(section.clone())
    }

    async fn insert_question(&self, question: &Question) -> StorageResult<Question> {
        self.write().questions.push(question.clone());
        Ok(question.clone())
    }

    async fn insert_quiz(&self, quiz: &Quiz) -> StorageResult<Quiz> {
        self.write().quizzes.push(quiz.clone());
        Ok(quiz.clone())
    }

    async fn list_paths(&self, outline_id: Uuid) -> StorageResult<Vec<Path>> {
        let mut out: Vec<Path> = self
            .read()
            .paths
            .iter()
            .filter(|p| p.outline_id == outline_id)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.order_index);
        Ok(out)
    }

    async fn list_lessons(&self, path_id: Uuid) -> StorageResult<Vec<Lesson>> {
        let mut out: Vec<Lesson> = self
            .read()
            .lessons
            .iter()
            .filter(|l| l.path_id == path_id)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.order_index);
        Ok(out)
    }

    async fn list_sections(&self, lesson_id: Uuid) -> StorageResult<Vec<LessonSection>> {
        let mut out: Vec<LessonSection> = self
            .read()
            .sections
            .iter()
            .filter(|s| s.lesson_id == lesson_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.order_index);
        Ok(out)
    }

    async fn list_questions_for_lesson(&self, lesson_id: Uuid) -> StorageResult<Vec<Question>> {
        let mut out: Vec<Question> = self
            .read()
            .questions
            .iter()
            .filter(|q| q.lesson_id == Some(lesson_id))
            .cloned()
            .collect();
        out.sort_by_key(|q| q.order_index);
        Ok(out)
    }

    async fn list_questions_for_quiz(&self, quiz_id: Uuid) -> StorageResult<Vec<Question>> {
        let mut out: Vec<Question> = self
            .read()
            .questions
            .iter()
            .filter(|q| q.quiz_id == Some(quiz_id))
            .cloned()
            .collect();
        out.sort_by_key(|q| q.order_index);
        Ok(out)
    }

    async fn list_quizzes(&self, outline_id: Uuid) -> StorageResult<Vec<Quiz>> {
        Ok(self
            .read()
            .quizzes
            .iter()
            .filter(|q| q.outline_id == outline_id)
            .cloned()
            .collect())
    }

    async fn list_documents(&self, knowledge_base_id: Uuid) -> StorageResult<Vec<KbDocument>> {
        Ok(self
            .read()
            .documents
            .iter()
            .filter(|d| d.knowledge_base_id == knowledge_base_id && d.is_completed())
            .cloned()
            .collect())
    }

    async fn count_chunks(&self, document_id: Uuid) -> StorageResult<usize> {
        Ok(self
            .read()
            .chunks
            .iter()
            .filter(|(c, _)| c.document_id == document_id)
            .count())
    }

    async fn list_chunks(
        &self,
        knowledge_base_id: Uuid,
        limit: usize,
    ) -> StorageResult<Vec<KbChunk>> {
        let t = self.read();
        let docs: Vec<Uuid> = t
            .documents
            .iter()
            .filter(|d| d.knowledge_base_id == knowledge_base_id && d.is_completed())
            .map(|d| d.id)
            .collect();
        Ok(t.chunks
            .iter()
            .filter(|(c, _)| docs.contains(&c.document_id))
            .take(limit)
            .map(|(c, _)| c.clone())
            .collect())
    }

    async fn first_chunks(&self, document_ids: &[Uuid]) -> StorageResult<Vec<KbChunk>> {
        let t = self.read();
        Ok(document_ids
            .iter()
            .filter_map(|doc| {
                t.chunks
                    .iter()
                    .filter(|(c, _)| c.document_id == *doc)
                    .min_by_key(|(c, _)| c.chunk_index)
                    .map(|(c, _)| c.clone())
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
        let t = self.read();
        let docs: Vec<Uuid> = t
            .documents
            .iter()
            .filter(|d| d.knowledge_base_id == knowledge_base_id && d.is_completed())
            .map(|d| d.id)
            .collect();
        let mut out: Vec<RetrievedChunk> = t
            .chunks
            .iter()
            .filter(|(c, _)| docs.contains(&c.document_id))
            .filter_map(|(c, e)| {
                let e = e.as_ref()?;
                let similarity = cosine_similarity(embedding, e);
                (similarity >= threshold).then(|| RetrievedChunk {
                    id: c.id,
                    document_id: c.document_id,
                    content: c.content.clone(),
                    similarity,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn match_chunks_filters_threshold_and_incomplete_documents() {
        let store = MemoryStorage::new();
        let kb = Uuid::new_v4();
        let done = KbDocument {
            id: Uuid::new_v4(),
            knowledge_base_id: kb,
            file_name: "a.pdf".into(),
            summary: None,
            status: "completed".into(),
            created_at: Utc::now(),
        };
        let pending = KbDocument {
            id: Uuid::new_v4(),
            status: "processing".into(),
            ..done.clone()
        };
        store.add_document(done.clone());
        store.add_document(pending.clone());
        let seeded = [
            (&done, vec![1.0, 0.0]),
            (&done, vec![0.0, 1.0]),
            (&pending, vec![1.0, 0.0]),
        ];
        for (doc, emb) in seeded {
            store.add_chunk(
                KbChunk {
                    id: Uuid::new_v4(),
                    document_id: doc.id,
                    chunk_index: 0,
                    content: "text".into(),
                },
                Some(emb),
            );
        }

        let hits = store.match_chunks(kb, &[1.0, 0.0], 0.5, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, done.id);
        assert_eq!(store.list_chunks(kb, 10).await.unwrap().len(), 2);
        assert_eq!(store.list_documents(kb).await.unwrap().len(), 1);
    }
}
