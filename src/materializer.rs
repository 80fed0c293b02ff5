//! Turns a persisted outline into the LMS hierarchy: paths, lessons, lesson
//! sections, lesson questions, module quizzes and the final exam.
//!
//! Lessons run in fixed-size concurrent batches; each task carries its own
//! order index, so completion order never affects persisted order. Questions
//! are generated only from section text read back from storage, never from
//! the outline or raw knowledge-base chunks. A failing lesson or quiz is
//! recorded in the report and skipped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::{excerpt, KnowledgeBaseAnalyzer, SearchScope};
use crate::cache::KbContentCache;
use crate::engine::{ContentEngine, FallbackHint};
use crate::guidance::{section_word_target, PromptBuilder};
use crate::job::{JobTracker, ProgressStage};
use crate::models::{
    CourseGenerationRequest, Lesson, LessonSection, Path, Provenance, Question, Quiz, QuizKind,
    RetrievedChunk, SectionType,
};
use crate::outline::{CourseOutline, Module, ModuleLesson};
use crate::payloads::{GeneratedQuestion, LessonSectionsPayload, QuestionsPayload};
use crate::provider::{CompletionOptions, ProviderError};
use crate::storage::{Storage, StorageError};

pub const SECTIONS_SYSTEM_PROMPT: &str = "You are an expert teacher writing complete lesson \
    content section by section. Respond with a single JSON object only.";

pub const LESSON_QUESTIONS_SYSTEM_PROMPT: &str = "You write assessment questions for a single \
    lesson. Every question must be answerable from the lesson content provided and nothing \
    else. Respond with a single JSON object only.";

pub const QUIZ_SYSTEM_PROMPT: &str = "You write cumulative quiz and exam questions covering \
    several lessons. Every question must be answerable from the lesson content provided and \
    nothing else. Respond with a single JSON object only.";

const KB_EXCERPT_CHARS: usize = 1200;
const LESSON_SECTION_CHARS: usize = 4000;
const QUIZ_SECTION_CHARS: usize = 700;

const QUESTIONS_FORMAT: &str = r#"{"questions": [{"question_text": string, "question_type": "multiple_choice|true_false|short_answer|essay", "options": [string], "correct_answer": string, "explanation": string, "difficulty": "easy|medium|hard", "points": integer, "learning_objectives": [string], "source_section": string}]}"#;

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Some sections of a lesson were stored before a write failed.
    #[error("{stored} of {planned} sections stored: {source}")]
    PartialSections {
        stored: usize,
        planned: usize,
        source: StorageError,
    },
    #[error("cancelled")]
    Cancelled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaterializationFailure {
    pub unit: String,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MaterializationReport {
    pub paths_created: usize,
    pub lessons_created: usize,
    pub sections_created: usize,
    pub fallback_sections: usize,
    pub questions_created: usize,
    pub quizzes_created: usize,
    pub failures: Vec<MaterializationFailure>,
}

impl MaterializationReport {
    fn record_failure(&mut self, unit: impl Into<String>, error: &dyn std::fmt::Display) {
        let unit = unit.into();
        tracing::warn!(unit = %unit, error = %error, "materialization step failed; continuing");
        self.failures.push(MaterializationFailure {
            unit,
            error: error.to_string(),
        });
    }
}

enum QuestionOwner {
    Lesson(Uuid),
    Quiz(Uuid),
}

struct SectionsOutcome {
    created: usize,
    provenance: Provenance,
}

struct LessonBuild {
    lesson: Option<Lesson>,
    sections: Option<SectionsOutcome>,
    failure: Option<(String, String)>,
}

#[derive(Clone)]
pub struct LmsEntityMaterializer {
    storage: Arc<dyn Storage>,
    engine: ContentEngine,
    analyzer: KnowledgeBaseAnalyzer,
    batch_size: usize,
}

impl LmsEntityMaterializer {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: ContentEngine,
        analyzer: KnowledgeBaseAnalyzer,
        batch_size: usize,
    ) -> Self {
        LmsEntityMaterializer {
            storage,
            engine,
            analyzer,
            batch_size: batch_size.max(1),
        }
    }

    /// Only cancellation aborts the walk; every other failure is recorded in
    /// the report.
    pub async fn create_lms_entities(
        &self,
        outline_id: Uuid,
        outline: &CourseOutline,
        request: &CourseGenerationRequest,
        cache: &mut KbContentCache,
        tracker: &JobTracker,
        cancel: &CancellationToken,
    ) -> Result<MaterializationReport, MaterializeError> {
        let mut report = MaterializationReport::default();
        let mode = outline.generation_mode;
        let kb = request.knowledge_base_id;

        let query = std::iter::once(outline.title.as_str())
            .chain(outline.learning_objectives.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("; ");
        let course_content = match cache
            .get_or_fetch(kb, mode, || {
                self.analyzer
                    .search_knowledge_base_for_generation(kb, &query, mode, SearchScope::Course)
            })
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                report.record_failure("course content", &e);
                Arc::new(Vec::new())
            }
        };

        // lessons and their sections
        let mut built: Vec<(Path, Vec<Lesson>)> = Vec::new();
        for (mi, module) in outline.modules.iter().enumerate() {
            ensure_running(cancel)?;
            let path = match self.create_path(outline_id, mi, module, request).await {
                Ok(p) => p,
                Err(e) => {
                    report.record_failure(format!("path {}", module.title), &e);
                    continue;
                }
            };
            report.paths_created += 1;

            let mut lessons = Vec::with_capacity(module.lessons.len());
            let indexed: Vec<(usize, &ModuleLesson)> = module.lessons.iter().enumerate().collect();
            for batch in indexed.chunks(self.batch_size) {
                ensure_running(cancel)?;
                let results = join_all(batch.iter().map(|(li, lesson)| {
                    self.build_lesson(path.id, *li, lesson, outline, request, &course_content)
                }))
                .await;
                for build in results {
                    if let Some((unit, error)) = build.failure {
                        report.record_failure(unit, &error);
                    }
                    let sections_complete = build.sections.is_some();
                    if let Some(s) = build.sections {
                        report.sections_created += s.created;
                        if s.provenance == Provenance::Fallback {
                            report.fallback_sections += s.created;
                        }
                    }
                    if let Some(lesson) = build.lesson {
                        report.lessons_created += 1;
                        // missing or truncated sections are never assessed
                        if sections_complete {
                            lessons.push(lesson);
                        }
                    }
                }
            }
            tracing::info!(
                outline_id = %outline_id,
                module = %module.title,
                assessable_lessons = lessons.len(),
                "module lessons materialized"
            );
            built.push((path, lessons));
        }
        checkpoint(tracker, ProgressStage::LessonsMaterialized).await;

        // assessments, grounded in persisted sections
        for (path, lessons) in &built {
            ensure_running(cancel)?;
            if request.include_assessments {
                for batch in lessons.chunks(self.batch_size) {
                    ensure_running(cancel)?;
                    let results = join_all(batch.iter().map(|lesson| async move {
                        (
                            lesson,
                            self.create_lesson_assessments_from_section_content(lesson, request)
                                .await,
                        )
                    }))
                    .await;
                    for (lesson, result) in results {
                        match result {
                            Ok(n) => report.questions_created += n,
                            Err(e) => {
                                report.record_failure(format!("assessment {}", lesson.title), &e)
                            }
                        }
                    }
                }
            }
            if request.include_quizzes {
                match self.create_module_quiz(outline_id, path, lessons, request).await {
                    Ok(Some(n)) => {
                        report.quizzes_created += 1;
                        report.questions_created += n;
                    }
                    Ok(None) => {}
                    Err(e) => report.record_failure(format!("quiz {}", path.title), &e),
                }
            }
        }

        if request.include_final_exam {
            ensure_running(cancel)?;
            let all: Vec<Lesson> = built.iter().flat_map(|(_, l)| l.iter().cloned()).collect();
            match self.create_final_exam(outline_id, outline, &all, request).await {
                Ok(Some(n)) => {
                    report.quizzes_created += 1;
                    report.questions_created += n;
                }
                Ok(None) => {}
                Err(e) => report.record_failure("final exam", &e),
            }
        }
        checkpoint(tracker, ProgressStage::AssessmentsMaterialized).await;

        tracing::info!(
            outline_id = %outline_id,
            paths = report.paths_created,
            lessons = report.lessons_created,
            sections = report.sections_created,
            questions = report.questions_created,
            failures = report.failures.len(),
            "materialization finished"
        );
        Ok(report)
    }

    async fn create_path(
        &self,
        outline_id: Uuid,
        index: usize,
        module: &Module,
        request: &CourseGenerationRequest,
    ) -> Result<Path, StorageError> {
        let path = Path {
            id: Uuid::new_v4(),
            outline_id,
            organization_id: request.organization_id,
            title: module.title.clone(),
            description: module.description.clone(),
            order_index: index as i32,
            published: false,
            created_by: request.user_id,
            created_at: Utc::now(),
        };
        self.storage.insert_path(&path).await
    }

    async fn build_lesson(
        &self,
        path_id: Uuid,
        index: usize,
        lesson: &ModuleLesson,
        outline: &CourseOutline,
        request: &CourseGenerationRequest,
        course_content: &[RetrievedChunk],
    ) -> LessonBuild {
        let row = Lesson {
            id: Uuid::new_v4(),
            path_id,
            title: lesson.title.clone(),
            description: lesson.description.clone(),
            order_index: index as i32,
            estimated_duration_hours: lesson.estimated_duration_hours,
            content_type: lesson.content_type,
            learning_objectives: lesson.learning_objectives.clone(),
            source_references: lesson.source_references.clone(),
            created_at: Utc::now(),
        };
        let row = match self.storage.insert_lesson(&row).await {
            Ok(r) => r,
            Err(e) => {
                return LessonBuild {
                    lesson: None,
                    sections: None,
                    failure: Some((format!("lesson {}", lesson.title), e.to_string())),
                }
            }
        };

        let chunks = relevant_chunks(
            course_content,
            lesson,
            SearchScope::Lesson.max_results(outline.generation_mode),
        );
        match self
            .create_lesson_sections_with_comprehensive_content(
                &row, lesson, outline, request, &chunks,
            )
            .await
        {
            Ok(outcome) => LessonBuild {
                lesson: Some(row),
                sections: Some(outcome),
                failure: None,
            },
            Err(e) => LessonBuild {
                lesson: Some(row),
                sections: None,
                failure: Some((format!("sections {}", lesson.title), e.to_string())),
            },
        }
    }

    /// One model call for every section of the lesson. Sections are stored
    /// with order_index equal to their position and a positional type.
    async fn create_lesson_sections_with_comprehensive_content(
        &self,
        row: &Lesson,
        lesson: &ModuleLesson,
        outline: &CourseOutline,
        request: &CourseGenerationRequest,
        chunks: &[RetrievedChunk],
    ) -> Result<SectionsOutcome, MaterializeError> {
        let hint = FallbackHint {
            lesson_title: lesson.title.clone(),
            section_titles: lesson.content_outline.clone(),
            learning_objectives: lesson.learning_objectives.clone(),
        };
        let prompt = sections_prompt(lesson, outline, chunks);
        let words = section_word_target(outline.lesson_detail_level) as u32;
        let planned = lesson.content_outline.len().max(1) as u32;
        let max_tokens = (planned * words * 2 + 1000).min(12_000);
        let generated = self
            .engine
            .generate_structured::<LessonSectionsPayload>(
                SECTIONS_SYSTEM_PROMPT,
                &prompt,
                &hint,
                &CompletionOptions::json(max_tokens, 0.6),
            )
            .await?;
        let provenance = generated.provenance();
        let sections = generated.value.sections;
        let count = sections.len();

        let rows: Vec<LessonSection> = sections
            .into_iter()
            .enumerate()
            .map(|(i, section)| {
                let (title, content) = section.into_content();
                let title = if title.trim().is_empty() {
                    lesson
                        .content_outline
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("Section {}", i + 1))
                } else {
                    title
                };
                LessonSection {
                    id: Uuid::new_v4(),
                    lesson_id: row.id,
                    title,
                    content,
                    section_type: SectionType::for_position(i, count),
                    order_index: i as i32,
                    provenance,
                    created_by: request.user_id,
                    created_at: Utc::now(),
                }
            })
            .collect();
        for (stored, section) in rows.iter().enumerate() {
            if let Err(source) = self.storage.insert_section(section).await {
                return Err(MaterializeError::PartialSections {
                    stored,
                    planned: count,
                    source,
                });
            }
        }
        tracing::debug!(
            lesson = %row.title,
            sections = count,
            %provenance,
            "lesson sections stored"
        );
        Ok(SectionsOutcome {
            created: count,
            provenance,
        })
    }

    /// Questions for one lesson, written from that lesson's persisted sections.
    async fn create_lesson_assessments_from_section_content(
        &self,
        lesson: &Lesson,
        request: &CourseGenerationRequest,
    ) -> Result<usize, MaterializeError> {
        let sections = self.storage.list_sections(lesson.id).await?;
        if sections.is_empty() {
            tracing::debug!(
                lesson = %lesson.title,
                "no sections stored; skipping lesson questions"
            );
            return Ok(0);
        }
        let count = request.assessment_settings.questions_per_lesson as usize;
        if count == 0 {
            return Ok(0);
        }
        let hint = FallbackHint {
            lesson_title: lesson.title.clone(),
            section_titles: sections.iter().map(|s| s.title.clone()).collect(),
            learning_objectives: lesson.learning_objectives.clone(),
        };
        let prompt = PromptBuilder::new()
            .block("LESSON", &lesson.title)
            .list("LEARNING OBJECTIVES", &lesson.learning_objectives)
            .block("LESSON CONTENT", taught_content(&sections, LESSON_SECTION_CHARS))
            .block(
                "TASK",
                format!(
                    "Write {count} questions that check understanding of the lesson content \
                     above. Use only facts, terms and examples that appear in it. Mix question \
                     types and difficulties."
                ),
            )
            .block("RESPONSE FORMAT", QUESTIONS_FORMAT)
            .build();
        let generated = self
            .engine
            .generate_structured::<QuestionsPayload>(
                LESSON_QUESTIONS_SYSTEM_PROMPT,
                &prompt,
                &hint,
                &CompletionOptions::json(3000, 0.4),
            )
            .await?;
        let provenance = generated.provenance();
        let n = self
            .persist_questions(
                generated.value.questions,
                QuestionOwner::Lesson(lesson.id),
                provenance,
                count,
                &lesson.learning_objectives,
                request.user_id,
            )
            .await?;
        Ok(n)
    }

    /// A path-level quiz across the module's lessons. `None` when the module
    /// has no stored content to assess.
    async fn create_module_quiz(
        &self,
        outline_id: Uuid,
        path: &Path,
        lessons: &[Lesson],
        request: &CourseGenerationRequest,
    ) -> Result<Option<usize>, MaterializeError> {
        let settings = &request.assessment_settings;
        let quiz = Quiz {
            id: Uuid::new_v4(),
            outline_id,
            path_id: Some(path.id),
            title: format!("{} Quiz", path.title),
            description: format!("Cumulative quiz covering the lessons of {}", path.title),
            assessment_type: QuizKind::ModuleQuiz,
            time_limit_minutes: settings.quiz_time_limit_minutes,
            passing_score_percentage: settings.passing_score_percentage,
            created_by: request.user_id,
            created_at: Utc::now(),
        };
        self.create_cumulative_quiz(quiz, lessons, settings.questions_per_quiz as usize, request)
            .await
    }

    /// The ownerless course exam across every lesson.
    async fn create_final_exam(
        &self,
        outline_id: Uuid,
        outline: &CourseOutline,
        lessons: &[Lesson],
        request: &CourseGenerationRequest,
    ) -> Result<Option<usize>, MaterializeError> {
        let settings = &request.assessment_settings;
        let exam = Quiz {
            id: Uuid::new_v4(),
            outline_id,
            path_id: None,
            title: format!("{} Final Exam", outline.title),
            description: format!("Final exam covering all of {}", outline.title),
            assessment_type: QuizKind::Exam,
            time_limit_minutes: settings.exam_time_limit_minutes,
            passing_score_percentage: settings.passing_score_percentage,
            created_by: request.user_id,
            created_at: Utc::now(),
        };
        self.create_cumulative_quiz(exam, lessons, settings.questions_per_exam as usize, request)
            .await
    }

    async fn create_cumulative_quiz(
        &self,
        quiz: Quiz,
        lessons: &[Lesson],
        count: usize,
        request: &CourseGenerationRequest,
    ) -> Result<Option<usize>, MaterializeError> {
        if count == 0 {
            return Ok(None);
        }
        let mut blocks = Vec::new();
        let mut section_titles = Vec::new();
        let mut objectives = Vec::new();
        for lesson in lessons {
            let sections = self.storage.list_sections(lesson.id).await?;
            if sections.is_empty() {
                continue;
            }
            section_titles.extend(sections.iter().map(|s| s.title.clone()));
            objectives.extend(lesson.learning_objectives.iter().cloned());
            blocks.push(format!(
                "# {}\n{}",
                lesson.title,
                taught_content(&sections, QUIZ_SECTION_CHARS)
            ));
        }
        if blocks.is_empty() {
            tracing::debug!(quiz = %quiz.title, "no stored sections; skipping quiz");
            return Ok(None);
        }

        let hint = FallbackHint {
            lesson_title: quiz.title.clone(),
            section_titles,
            learning_objectives: objectives.clone(),
        };
        let prompt = PromptBuilder::new()
            .block("ASSESSMENT", format!("{} ({})", quiz.title, quiz.assessment_type))
            .block("LESSON CONTENT", blocks.join("\n\n"))
            .block(
                "TASK",
                format!(
                    "Write {count} questions that together cover every lesson above. Use only \
                     material that appears in the lesson content."
                ),
            )
            .block("RESPONSE FORMAT", QUESTIONS_FORMAT)
            .build();
        let max_tokens = (count as u32 * 250 + 1000).min(12_000);
        let generated = self
            .engine
            .generate_structured::<QuestionsPayload>(
                QUIZ_SYSTEM_PROMPT,
                &prompt,
                &hint,
                &CompletionOptions::json(max_tokens, 0.4),
            )
            .await?;
        let provenance = generated.provenance();

        let quiz = self.storage.insert_quiz(&quiz).await?;
        let n = self
            .persist_questions(
                generated.value.questions,
                QuestionOwner::Quiz(quiz.id),
                provenance,
                count,
                &objectives,
                request.user_id,
            )
            .await?;
        tracing::info!(
            quiz = %quiz.title,
            kind = %quiz.assessment_type,
            questions = n,
            "quiz created"
        );
        Ok(Some(n))
    }

    async fn persist_questions(
        &self,
        questions: Vec<GeneratedQuestion>,
        owner: QuestionOwner,
        provenance: Provenance,
        limit: usize,
        default_objectives: &[String],
        created_by: Uuid,
    ) -> Result<usize, StorageError> {
        let (lesson_id, quiz_id) = match owner {
            QuestionOwner::Lesson(id) => (Some(id), None),
            QuestionOwner::Quiz(id) => (None, Some(id)),
        };
        let mut stored = 0;
        for q in questions.into_iter().filter(GeneratedQuestion::is_valid).take(limit) {
            let question = Question {
                id: Uuid::new_v4(),
                lesson_id,
                quiz_id,
                question_type: q.kind(),
                difficulty: q.difficulty(),
                points: q.points(),
                learning_objectives: if q.learning_objectives.is_empty() {
                    default_objectives.to_vec()
                } else {
                    q.learning_objectives
                },
                question_text: q.question_text,
                options: q.options,
                correct_answer: q.correct_answer,
                explanation: q.explanation.filter(|e| !e.trim().is_empty()),
                provenance,
                order_index: stored as i32,
                created_by,
                created_at: Utc::now(),
            };
            self.storage.insert_question(&question).await?;
            stored += 1;
        }
        Ok(stored)
    }
}

fn ensure_running(cancel: &CancellationToken) -> Result<(), MaterializeError> {
    if cancel.is_cancelled() {
        Err(MaterializeError::Cancelled)
    } else {
        Ok(())
    }
}

async fn checkpoint(tracker: &JobTracker, stage: ProgressStage) {
    if let Err(e) = tracker.checkpoint(stage).await {
        tracing::warn!(?stage, error = %e, "progress checkpoint not recorded");
    }
}

fn taught_content(sections: &[LessonSection], per_section_chars: usize) -> String {
    sections
        .iter()
        .map(|s| format!("## {}\n{}", s.title, excerpt(&s.content.plain_text(), per_section_chars)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn sections_prompt(
    lesson: &ModuleLesson,
    outline: &CourseOutline,
    chunks: &[RetrievedChunk],
) -> String {
    let section_count = lesson.content_outline.len();
    let words = section_word_target(outline.lesson_detail_level);
    let material: Vec<String> = chunks
        .iter()
        .map(|c| excerpt(&c.content, KB_EXCERPT_CHARS))
        .collect();
    let mut context = vec![format!("Course: {}", outline.title)];
    if let Some(a) = &outline.target_audience {
        context.push(format!("Audience: {a}"));
    }
    if let Some(p) = &outline.prerequisites {
        context.push(format!("Prerequisites: {p}"));
    }
    PromptBuilder::new()
        .list("COURSE", &context)
        .block(
            "LESSON",
            format!(
                "{} ({}, about {} hours)\n{}",
                lesson.title,
                lesson.content_type,
                lesson.estimated_duration_hours,
                lesson.description
            ),
        )
        .list("LEARNING OBJECTIVES", &lesson.learning_objectives)
        .list("SECTIONS TO WRITE, IN ORDER", &lesson.content_outline)
        .list("KNOWLEDGE BASE CONTENT", &material)
        .guidance(outline.academic_level, outline.lesson_detail_level, outline.generation_mode)
        .block(
            "TASK",
            format!(
                "Write all {section_count} sections in one response, in the order listed. Each \
                 section needs an introduction, about {words} words of main teaching content, \
                 examples, common misconceptions, comprehension checks and a summary. The first \
                 section introduces the lesson and the last one summarizes it."
            ),
        )
        .block(
            "RESPONSE FORMAT",
            r#"{"sections": [{"section_title": string, "introduction": string, "main_content": string, "examples": [string], "misconceptions": [string], "comprehension_checks": [string], "summary": string}]}"#,
        )
        .build()
}

fn keywords(text: &str) -> HashSet<String> {
    const STOP: [&str; 12] = [
        "this", "that", "with", "from", "into", "their", "they", "what", "when", "which", "will",
        "about",
    ];
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4)
        .map(str::to_lowercase)
        .filter(|w| !STOP.contains(&w.as_str()))
        .collect()
}

/// Local relevance filter over the cached course content. Chunks named in the
/// lesson's source references come first, then chunks ranked by keyword
/// overlap with the lesson's title, description, objectives and topics.
pub fn relevant_chunks(
    course: &[RetrievedChunk],
    lesson: &ModuleLesson,
    cap: usize,
) -> Vec<RetrievedChunk> {
    let mut out: Vec<RetrievedChunk> = lesson
        .source_references
        .iter()
        .filter_map(|id| course.iter().find(|c| c.id == *id))
        .cloned()
        .collect();

    let mut lesson_text = format!("{} {}", lesson.title, lesson.description);
    for s in lesson.learning_objectives.iter().chain(&lesson.content_outline) {
        lesson_text.push(' ');
        lesson_text.push_str(s);
    }
    let wanted = keywords(&lesson_text);

    let mut scored: Vec<(usize, &RetrievedChunk)> = course
        .iter()
        .filter(|c| !lesson.source_references.contains(&c.id))
        .map(|c| (keywords(&c.content).intersection(&wanted).count(), c))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    out.extend(scored.into_iter().map(|(_, c)| c.clone()));

    if out.is_empty() {
        out.extend(course.iter().take(cap).cloned());
    }
    out.truncate(cap);
    out
}
