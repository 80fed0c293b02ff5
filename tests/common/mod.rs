//! Shared doubles for integration tests: a scripted model provider and
//! knowledge-base fixtures on top of `MemoryStorage`.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use coursegen_runtime::analyzer::ANALYSIS_SYSTEM_PROMPT;
use coursegen_runtime::job::{GenerationJob, JobUpdate};
use coursegen_runtime::materializer::{
    LESSON_QUESTIONS_SYSTEM_PROMPT, QUIZ_SYSTEM_PROMPT, SECTIONS_SYSTEM_PROMPT,
};
use coursegen_runtime::models::{
    AcademicLevel, AssessmentSettings, CourseGenerationRequest, DetailLevel, GenerationMode,
    KbChunk, KbDocument, Lesson, LessonSection, Path, Question, Quiz, RetrievedChunk,
};
use coursegen_runtime::outline::StoredOutline;
use coursegen_runtime::outline_generator::OUTLINE_SYSTEM_PROMPT;
use coursegen_runtime::provider::{CompletionOptions, ModelProvider, ProviderError};
use coursegen_runtime::storage::memory::MemoryStorage;
use coursegen_runtime::storage::{Storage, StorageError, StorageResult};

pub const TOPICS: [&str; 6] = [
    "Photosynthesis",
    "Pollination",
    "Germination",
    "Respiration",
    "Transpiration",
    "Osmosis",
];

/// Marker embedded in every knowledge-base chunk.
pub const KB_MARKER: &str = "kbsecret";

/// Word that only appears in the section text of the lesson titled `title`.
pub fn glossary_term(title: &str) -> String {
    let slug: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    format!("glossterm{slug}")
}

#[derive(Debug, Clone)]
pub struct Call {
    pub system: String,
    pub prompt: String,
}

/// Answers each system prompt with well-formed JSON derived from the
/// user prompt, and records every call.
#[derive(Default)]
pub struct ScriptedProvider {
    pub calls: Mutex<Vec<Call>>,
    pub fail_outline: bool,
    pub panic_on_outline: bool,
    /// Section generation fails for the lesson with this title.
    pub fail_lesson: Option<String>,
    /// Section generation answers with non-JSON prose for this lesson.
    pub garbage_lesson: Option<String>,
    /// Section generation waits for a permit when set.
    pub gate: Option<Arc<Semaphore>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompts_for(&self, system: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.system == system)
            .map(|c| c.prompt.clone())
            .collect()
    }

    pub fn call_count(&self, system: &str) -> usize {
        self.prompts_for(system).len()
    }

    fn outline(&self, prompt: &str) -> String {
        let weeks = number_after(prompt, "Produce exactly ").unwrap_or(1);
        let per_week = number_after(prompt, "contain exactly ").unwrap_or(1);
        let mut k = 0usize;
        let modules: Vec<serde_json::Value> = (1..=weeks)
            .map(|w| {
                let lessons: Vec<serde_json::Value> = (0..per_week)
                    .map(|_| {
                        let title = topic(k);
                        k += 1;
                        json!({
                            "title": title,
                            "description": format!("All about {title}"),
                            "estimatedDurationHours": 1.5,
                            "contentType": "lecture",
                            "learningObjectives": [format!("Explain {title}")],
                            "contentOutline": [
                                format!("What is {title}"),
                                format!("{title} in practice"),
                                format!("{title} review"),
                            ],
                            "sourceReferences": ["chunk_1"],
                        })
                    })
                    .collect();
                json!({
                    "title": format!("Week {w}: Plant Life"),
                    "description": "Plants",
                    "lessons": lessons,
                    "assessments": [{"title": "Check-in", "type": "quiz"}],
                })
            })
            .collect();
        json!({
            "title": "Plant Biology",
            "description": "A course about plants",
            "learningObjectives": ["Understand plant processes"],
            "modules": modules,
        })
        .to_string()
    }

    fn sections(&self, prompt: &str) -> Result<String, ProviderError> {
        let title = block_line(prompt, "## LESSON\n")
            .and_then(|l| l.split(" (").next().map(str::to_string))
            .unwrap_or_default();
        if self.fail_lesson.as_deref() == Some(title.as_str()) {
            return Err(ProviderError::Status {
                status: 400,
                body: "content policy".into(),
            });
        }
        if self.garbage_lesson.as_deref() == Some(title.as_str()) {
            return Ok(format!("I am not able to write {title} right now, sorry."));
        }
        let term = glossary_term(&title);
        let planned = block_items(prompt, "## SECTIONS TO WRITE, IN ORDER\n");
        let sections: Vec<serde_json::Value> = planned
            .into_iter()
            .map(|s| {
                json!({
                    "sectionTitle": s,
                    "introduction": format!("In this part we study {s}."),
                    "mainContent": format!(
                        "The key word here is {term}. {title} matters to every plant."
                    ),
                    "examples": [format!("A sunflower showing {title}")],
                    "commonMisconceptions": [],
                    "comprehensionChecks": [format!("What is {term}?")],
                    "summary": format!("{s} covered."),
                })
            })
            .collect();
        // wrapped in prose and fences to exercise the repair path
        Ok(format!(
            "Sure! Here is the lesson:\n```json\n{}\n```",
            json!({ "sections": sections })
        ))
    }

    fn questions(&self, prompt: &str) -> String {
        let terms: Vec<&str> = prompt
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| w.starts_with("glossterm"))
            .collect();
        let mut unique: Vec<&str> = Vec::new();
        for t in terms {
            if !unique.contains(&t) {
                unique.push(t);
            }
        }
        let questions: Vec<serde_json::Value> = unique
            .iter()
            .map(|t| {
                json!({
                    "questionText": format!("Which statement best defines {t}?"),
                    "questionType": "Multiple Choice",
                    "options": [format!("{t} is the key word of the lesson"), "Something else"],
                    "correctAnswer": format!("{t} is the key word of the lesson"),
                    "explanation": "Stated in the lesson.",
                    "difficulty": "easy",
                    "points": 1,
                })
            })
            .collect();
        json!({ "questions": questions }).to_string()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(Call {
            system: system.to_string(),
            prompt: prompt.to_string(),
        });
        match system {
            s if s == ANALYSIS_SYSTEM_PROMPT => Ok(json!({
                "subject_coverage": ["botany"],
                "content_quality": "medium",
                "concept_coverage": ["photosynthesis"],
            })
            .to_string()),
            s if s == OUTLINE_SYSTEM_PROMPT => {
                if self.panic_on_outline {
                    panic!("outline script exploded");
                }
                if self.fail_outline {
                    return Err(ProviderError::Status {
                        status: 503,
                        body: "overloaded".into(),
                    });
                }
                Ok(self.outline(prompt))
            }
            s if s == SECTIONS_SYSTEM_PROMPT => {
                if let Some(gate) = &self.gate {
                    let _permit = gate.acquire().await;
                }
                self.sections(prompt)
            }
            s if s == LESSON_QUESTIONS_SYSTEM_PROMPT || s == QUIZ_SYSTEM_PROMPT => {
                Ok(self.questions(prompt))
            }
            _ => Ok("{}".to_string()),
        }
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![1.0, 0.5, 0.25])
    }
}

fn topic(k: usize) -> String {
    let base = TOPICS[k % TOPICS.len()];
    if k < TOPICS.len() {
        base.to_string()
    } else {
        format!("{base} {}", k / TOPICS.len() + 1)
    }
}

fn number_after(text: &str, marker: &str) -> Option<usize> {
    let rest = &text[text.find(marker)? + marker.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn block_line(prompt: &str, header: &str) -> Option<String> {
    let rest = &prompt[prompt.find(header)? + header.len()..];
    rest.lines().next().map(str::to_string)
}

fn block_items(prompt: &str, header: &str) -> Vec<String> {
    let Some(start) = prompt.find(header) else {
        return Vec::new();
    };
    prompt[start + header.len()..]
        .lines()
        .take_while(|l| l.starts_with("- "))
        .map(|l| l.trim_start_matches("- ").to_string())
        .collect()
}

/// A knowledge base of `docs` completed documents with `chunks` chunks each.
pub fn seed_knowledge_base(storage: &MemoryStorage, docs: usize, chunks: usize) -> Uuid {
    let kb = Uuid::new_v4();
    for d in 0..docs {
        let doc = KbDocument {
            id: Uuid::new_v4(),
            knowledge_base_id: kb,
            file_name: format!("plants-{d}.pdf"),
            summary: Some("Notes on plant biology".into()),
            status: "completed".into(),
            created_at: Utc::now(),
        };
        for i in 0..chunks {
            storage.add_chunk(
                KbChunk {
                    id: Uuid::new_v4(),
                    document_id: doc.id,
                    chunk_index: i as i32,
                    content: format!(
                        "{KB_MARKER}-{d}-{i} plant biology notes covering photosynthesis, \
                         pollination and germination"
                    ),
                },
                Some(vec![1.0, 0.5, 0.25]),
            );
        }
        storage.add_document(doc);
    }
    kb
}

pub fn request(kb: Uuid, weeks: u32, per_week: u32) -> CourseGenerationRequest {
    CourseGenerationRequest {
        knowledge_base_id: kb,
        organization_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        title: "Plant Biology".into(),
        description: Some("How plants live and grow".into()),
        duration_weeks: weeks,
        lessons_per_week: per_week,
        academic_level: AcademicLevel::HighSchool,
        lesson_detail_level: DetailLevel::Basic,
        target_audience: None,
        prerequisites: None,
        include_assessments: true,
        include_quizzes: true,
        include_final_exam: false,
        generation_mode: Some(GenerationMode::KbSupplemented),
        assessment_settings: AssessmentSettings {
            questions_per_lesson: 3,
            ..AssessmentSettings::default()
        },
    }
}

/// Polls storage until the job is terminal.
pub async fn wait_for_terminal(storage: &dyn Storage, job_id: Uuid) -> GenerationJob {
    for _ in 0..500 {
        if let Some(job) = storage.get_job(job_id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

/// Delegates to `MemoryStorage`, except that storing the section titled
/// `fail_section` fails.
pub struct FlakyStorage {
    pub inner: Arc<MemoryStorage>,
    pub fail_section: String,
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn insert_job(&self, job: &GenerationJob) -> StorageResult<Uuid> {
        self.inner.insert_job(job).await
    }
    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> StorageResult<()> {
        self.inner.update_job(id, update).await
    }
    async fn get_job(&self, id: Uuid) -> StorageResult<Option<GenerationJob>> {
        self.inner.get_job(id).await
    }
    async fn insert_outline(&self, outline: &StoredOutline) -> StorageResult<Uuid> {
        self.inner.insert_outline(outline).await
    }
    async fn get_outline(&self, id: Uuid) -> StorageResult<Option<StoredOutline>> {
        self.inner.get_outline(id).await
    }
    async fn insert_path(&self, path: &Path) -> StorageResult<Path> {
        self.inner.insert_path(path).await
    }
    async fn insert_lesson(&self, lesson: &Lesson) -> StorageResult<Lesson> {
        self.inner.insert_lesson(lesson).await
    }
    async fn insert_section(&self, section: &LessonSection) -> StorageResult<LessonSection> {
        if section.title == self.fail_section {
            return Err(StorageError::Malformed {
                entity: "lesson_section",
                message: "disk full".into(),
            });
        }
        self.inner.insert_section(section).await
    }
    async fn insert_question(&self, question: &Question) -> StorageResult<Question> {
        self.inner.insert_question(question).await
    }
    async fn insert_quiz(&self, quiz: &Quiz) -> StorageResult<Quiz> {
        self.inner.insert_quiz(quiz).await
    }
    async fn list_paths(&self, outline_id: Uuid) -> StorageResult<Vec<Path>> {
        self.inner.list_paths(outline_id).await
    }
    async fn list_lessons(&self, path_id: Uuid) -> StorageResult<Vec<Lesson>> {
        self.inner.list_lessons(path_id).await
    }
    async fn list_sections(&self, lesson_id: Uuid) -> StorageResult<Vec<LessonSection>> {
        self.inner.list_sections(lesson_id).await
    }
    async fn list_questions_for_lesson(&self, lesson_id: Uuid) -> StorageResult<Vec<Question>> {
        self.inner.list_questions_for_lesson(lesson_id).await
    }
    async fn list_questions_for_quiz(&self, quiz_id: Uuid) -> StorageResult<Vec<Question>> {
        self.inner.list_questions_for_quiz(quiz_id).await
    }
    async fn list_quizzes(&self, outline_id: Uuid) -> StorageResult<Vec<Quiz>> {
        self.inner.list_quizzes(outline_id).await
    }
    async fn list_documents(&self, knowledge_base_id: Uuid) -> StorageResult<Vec<KbDocument>> {
        self.inner.list_documents(knowledge_base_id).await
    }
    async fn count_chunks(&self, document_id: Uuid) -> StorageResult<usize> {
        self.inner.count_chunks(document_id).await
    }
    async fn list_chunks(
        &self,
        knowledge_base_id: Uuid,
        limit: usize,
    ) -> StorageResult<Vec<KbChunk>> {
        self.inner.list_chunks(knowledge_base_id, limit).await
    }
    async fn first_chunks(&self, document_ids: &[Uuid]) -> StorageResult<Vec<KbChunk>> {
        self.inner.first_chunks(document_ids).await
    }
    async fn match_chunks(
        &self,
        knowledge_base_id: Uuid,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> StorageResult<Vec<RetrievedChunk>> {
        self.inner
            .match_chunks(knowledge_base_id, embedding, threshold, limit)
            .await
    }
}
