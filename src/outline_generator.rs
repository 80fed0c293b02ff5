//! Course outline generation: one model call, no fallback. The parsed draft
//! is forced into the requested shape and its source references are
//! reconciled against real chunk ids before anything is persisted.

use serde::Deserialize;
use thiserror::Error;

use crate::analyzer::{excerpt, KnowledgeBaseAnalyzer, SearchScope};
use crate::engine::{ContentEngine, EngineError, FallbackHint, StructuredOutput};
use crate::guidance::{sections_per_lesson, PromptBuilder};
use crate::models::{
    CourseGenerationRequest, GenerationMode, KnowledgeBaseAnalysis, RetrievedChunk,
};
use crate::outline::{
    reconcile_references, ContentType, CourseOutline, Module, ModuleAssessment,
    ModuleAssessmentType, ModuleLesson, OutlineStatus, ReferenceDistributor,
};
use crate::payloads::string_list;
use crate::provider::CompletionOptions;
use crate::storage::StorageError;

pub const OUTLINE_SYSTEM_PROMPT: &str = "You are an expert curriculum designer. You build \
    week-by-week course outlines from a knowledge base. Respond with a single JSON object only.";

const SAMPLE_EXCERPT_CHARS: usize = 500;

#[derive(Error, Debug)]
pub enum OutlineError {
    #[error("outline generation failed: {0}")]
    Generation(#[from] EngineError),
    #[error("content sampling failed: {0}")]
    Sampling(#[from] StorageError),
}

// --- model draft ---

#[derive(Debug, Clone, Deserialize, Default)]
struct LessonDraft {
    #[serde(default, alias = "name", alias = "lessonTitle")]
    title: String,
    #[serde(default, deserialize_with = "crate::payloads::text_or_list")]
    description: String,
    #[serde(
        default,
        alias = "estimatedDurationHours",
        alias = "duration_hours",
        deserialize_with = "crate::payloads::lenient_number"
    )]
    estimated_duration_hours: Option<f32>,
    #[serde(default, alias = "contentType", alias = "type")]
    content_type: String,
    #[serde(default, alias = "learningObjectives", deserialize_with = "string_list")]
    learning_objectives: Vec<String>,
    #[serde(
        default,
        alias = "contentOutline",
        alias = "topics",
        alias = "sections",
        deserialize_with = "string_list"
    )]
    content_outline: Vec<String>,
    #[serde(default, alias = "requiredResources", deserialize_with = "string_list")]
    required_resources: Vec<String>,
    #[serde(
        default,
        alias = "sourceReferences",
        alias = "sources",
        deserialize_with = "string_list"
    )]
    source_references: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct AssessmentDraft {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "assessmentType", alias = "type")]
    assessment_type: String,
    #[serde(default, deserialize_with = "crate::payloads::text_or_list")]
    description: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ModuleDraft {
    #[serde(default, alias = "name", alias = "moduleTitle")]
    title: String,
    #[serde(default, deserialize_with = "crate::payloads::text_or_list")]
    description: String,
    #[serde(
        default,
        alias = "durationWeeks",
        deserialize_with = "crate::payloads::lenient_number"
    )]
    duration_weeks: Option<u32>,
    #[serde(default, alias = "learningObjectives", deserialize_with = "string_list")]
    learning_objectives: Vec<String>,
    #[serde(default)]
    lessons: Vec<LessonDraft>,
    #[serde(default)]
    assessments: Vec<AssessmentDraft>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct OutlineDraft {
    #[serde(default, alias = "courseTitle")]
    title: String,
    #[serde(default, deserialize_with = "crate::payloads::text_or_list")]
    description: String,
    #[serde(default, alias = "learningObjectives", deserialize_with = "string_list")]
    learning_objectives: Vec<String>,
    #[serde(default, alias = "weeks", alias = "courseModules")]
    modules: Vec<ModuleDraft>,
}

impl StructuredOutput for OutlineDraft {
    const SHAPE: &'static str = "course_outline";

    fn fallback(_hint: &FallbackHint) -> Self {
        OutlineDraft::default()
    }

    fn is_usable(&self) -> bool {
        !self.modules.is_empty()
    }
}

fn non_empty_or(value: String, default: impl FnOnce() -> String) -> String {
    if value.trim().is_empty() {
        default()
    } else {
        value
    }
}

impl OutlineDraft {
    /// Converts the draft into an outline; references stay raw until
    /// reconciliation.
    fn into_outline(
        self,
        request: &CourseGenerationRequest,
        analysis: &KnowledgeBaseAnalysis,
        mode: GenerationMode,
    ) -> (CourseOutline, Vec<Vec<Vec<String>>>) {
        let mut raw_refs = Vec::with_capacity(self.modules.len());
        let modules = self
            .modules
            .into_iter()
            .enumerate()
            .map(|(mi, m)| {
                let order = mi as u32 + 1;
                let mut module_refs = Vec::with_capacity(m.lessons.len());
                let lessons = m
                    .lessons
                    .into_iter()
                    .enumerate()
                    .map(|(li, l)| {
                        module_refs.push(l.source_references);
                        ModuleLesson {
                            title: non_empty_or(l.title, || {
                                format!("Week {order} Lesson {}", li + 1)
                            }),
                            description: l.description,
                            order: li as u32 + 1,
                            estimated_duration_hours: l
                                .estimated_duration_hours
                                .filter(|h| h.is_finite() && *h > 0.0)
                                .unwrap_or(1.0),
                            content_type: ContentType::from_lenient(&l.content_type)
                                .unwrap_or(ContentType::Lecture),
                            learning_objectives: l.learning_objectives,
                            content_outline: l.content_outline,
                            required_resources: l.required_resources,
                            source_references: Vec::new(),
                        }
                    })
                    .collect();
                raw_refs.push(module_refs);
                Module {
                    title: non_empty_or(m.title, || format!("Week {order}")),
                    description: m.description,
                    order,
                    duration_weeks: m.duration_weeks.unwrap_or(1),
                    learning_objectives: m.learning_objectives,
                    lessons,
                    assessments: m
                        .assessments
                        .into_iter()
                        .map(|a| ModuleAssessment {
                            assessment_type: ModuleAssessmentType::from_lenient(&a.assessment_type)
                                .unwrap_or(ModuleAssessmentType::Quiz),
                            title: a.title,
                            description: a.description,
                        })
                        .collect(),
                }
            })
            .collect();

        let outline = CourseOutline {
            title: non_empty_or(self.title, || request.title.clone()),
            description: non_empty_or(self.description, || {
                request.description.clone().unwrap_or_default()
            }),
            generation_mode: mode,
            learning_objectives: if self.learning_objectives.is_empty() {
                analysis.recommended_objectives.clone()
            } else {
                self.learning_objectives
            },
            estimated_duration_weeks: request.duration_weeks,
            modules,
            kb_analysis: analysis.clone(),
            status: OutlineStatus::Draft,
            academic_level: request.academic_level,
            lesson_detail_level: request.lesson_detail_level,
            target_audience: request.target_audience.clone(),
            prerequisites: request.prerequisites.clone(),
            lessons_per_week: request.lessons_per_week,
            assessment_settings: request.assessment_settings.clone(),
        };
        (outline, raw_refs)
    }
}

/// Shape enforcement plus reference reconciliation, applied to every outline
/// before it is returned.
pub fn finalize_outline(
    outline: &mut CourseOutline,
    raw_refs: &[Vec<Vec<String>>],
    weeks: u32,
    lessons_per_week: u32,
    known_chunks: &[uuid::Uuid],
) {
    outline.enforce_structure(weeks, lessons_per_week);
    let mut distributor = ReferenceDistributor::new(known_chunks);
    for (mi, module) in outline.modules.iter_mut().enumerate() {
        for (li, lesson) in module.lessons.iter_mut().enumerate() {
            let raw = raw_refs
                .get(mi)
                .and_then(|m| m.get(li))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            lesson.source_references = reconcile_references(raw, known_chunks, &mut distributor);
        }
    }
}

#[derive(Clone)]
pub struct CourseOutlineGenerator {
    analyzer: KnowledgeBaseAnalyzer,
    engine: ContentEngine,
}

impl CourseOutlineGenerator {
    pub fn new(analyzer: KnowledgeBaseAnalyzer, engine: ContentEngine) -> Self {
        CourseOutlineGenerator { analyzer, engine }
    }

    /// Chunks embedded in the outline prompt.
    pub async fn sample_content(
        &self,
        request: &CourseGenerationRequest,
        mode: GenerationMode,
    ) -> Result<Vec<RetrievedChunk>, StorageError> {
        let query = match &request.description {
            Some(d) if !d.trim().is_empty() => format!("{}: {}", request.title, d),
            _ => request.title.clone(),
        };
        self.analyzer
            .search_knowledge_base_for_generation(
                request.knowledge_base_id,
                &query,
                mode,
                SearchScope::Outline,
            )
            .await
    }

    pub async fn generate_course_outline(
        &self,
        request: &CourseGenerationRequest,
        analysis: &KnowledgeBaseAnalysis,
        mode: GenerationMode,
    ) -> Result<CourseOutline, OutlineError> {
        let sample = self.sample_content(request, mode).await?;
        self.generate_from_sample(request, analysis, mode, &sample)
            .await
    }

    pub async fn generate_from_sample(
        &self,
        request: &CourseGenerationRequest,
        analysis: &KnowledgeBaseAnalysis,
        mode: GenerationMode,
        sample: &[RetrievedChunk],
    ) -> Result<CourseOutline, OutlineError> {
        let prompt = outline_prompt(request, analysis, mode, sample);
        let max_tokens = 2000 + 350 * request.total_lessons().min(60);
        let (draft, strategy) = self
            .engine
            .generate_strict::<OutlineDraft>(
                OUTLINE_SYSTEM_PROMPT,
                &prompt,
                &CompletionOptions::json(max_tokens, 0.4),
            )
            .await?;

        let returned_modules = draft.modules.len();
        let (mut outline, raw_refs) = draft.into_outline(request, analysis, mode);
        let known: Vec<uuid::Uuid> = sample.iter().map(|c| c.id).collect();
        finalize_outline(
            &mut outline,
            &raw_refs,
            request.duration_weeks,
            request.lessons_per_week,
            &known,
        );
        tracing::info!(
            title = %outline.title,
            ?strategy,
            returned_modules,
            modules = outline.modules.len(),
            lessons = outline.lesson_count(),
            "course outline generated"
        );
        Ok(outline)
    }
}

fn outline_prompt(
    request: &CourseGenerationRequest,
    analysis: &KnowledgeBaseAnalysis,
    mode: GenerationMode,
    sample: &[RetrievedChunk],
) -> String {
    let mut config = vec![
        format!("Title: {}", request.title),
        format!("Duration: {} weeks", request.duration_weeks),
        format!("Lessons per week: {}", request.lessons_per_week),
        format!("Academic level: {}", request.academic_level),
        format!("Lesson detail level: {}", request.lesson_detail_level),
        format!(
            "Assessments: lessons={}, module quizzes={}, final exam={}",
            request.include_assessments, request.include_quizzes, request.include_final_exam
        ),
    ];
    if let Some(d) = &request.description {
        config.push(format!("Description: {d}"));
    }
    if let Some(a) = &request.target_audience {
        config.push(format!("Target audience: {a}"));
    }
    if let Some(p) = &request.prerequisites {
        config.push(format!("Prerequisites: {p}"));
    }

    let analysis_summary = vec![
        format!(
            "{} documents, {} chunks, depth {}, quality {}",
            analysis.total_documents,
            analysis.total_chunks,
            analysis.content_depth,
            analysis.content_quality
        ),
        format!("Subjects: {}", analysis.subject_coverage.join(", ")),
        format!("Concepts: {}", analysis.concept_coverage.join(", ")),
        format!("Gaps: {}", analysis.knowledge_gaps.join(", ")),
    ];

    let excerpts: Vec<String> = sample
        .iter()
        .map(|c| format!("[{}] {}", c.id, excerpt(&c.content, SAMPLE_EXCERPT_CHARS)))
        .collect();

    PromptBuilder::new()
        .list("COURSE CONFIGURATION", &config)
        .list("KNOWLEDGE BASE ANALYSIS", &analysis_summary)
        .list("SUGGESTED OBJECTIVES", &analysis.recommended_objectives)
        .list("CONTENT SAMPLE (chunk id in brackets)", &excerpts)
        .guidance(request.academic_level, request.lesson_detail_level, mode)
        .block(
            "STRUCTURE REQUIREMENTS",
            format!(
                "Produce exactly {weeks} modules, one per week, in order. Each module must \
                 contain exactly {lessons} lessons. Give every lesson {sections} content \
                 outline topics, which become its sections. In source_references list the \
                 bracketed chunk ids that support the lesson.",
                weeks = request.duration_weeks,
                lessons = request.lessons_per_week,
                sections = sections_per_lesson(request.lesson_detail_level),
            ),
        )
        .block(
            "RESPONSE FORMAT",
            r#"{"title": string, "description": string, "learning_objectives": [string], "modules": [{"title": string, "description": string, "duration_weeks": 1, "learning_objectives": [string], "lessons": [{"title": string, "description": string, "estimated_duration_hours": number, "content_type": "lecture|activity|discussion|reading|lab", "learning_objectives": [string], "content_outline": [string], "required_resources": [string], "source_references": [string]}], "assessments": [{"title": string, "assessment_type": "quiz|assignment|project", "description": string}]}]}"#,
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parse_structured;
    use crate::models::{
        AcademicLevel, AssessmentSettings, ContentDepth, ContentQuality, DetailLevel,
    };
    use uuid::Uuid;

    fn request(weeks: u32, per_week: u32) -> CourseGenerationRequest {
        CourseGenerationRequest {
            knowledge_base_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            title: "Plant Biology".into(),
            description: None,
            duration_weeks: weeks,
            lessons_per_week: per_week,
            academic_level: AcademicLevel::HighSchool,
            lesson_detail_level: DetailLevel::Basic,
            target_audience: None,
            prerequisites: None,
            include_assessments: true,
            include_quizzes: true,
            include_final_exam: false,
            generation_mode: None,
            assessment_settings: AssessmentSettings::default(),
        }
    }

    fn analysis() -> KnowledgeBaseAnalysis {
        KnowledgeBaseAnalysis {
            total_documents: 3,
            total_chunks: 9,
            average_chunks_per_document: 3.0,
            content_depth: ContentDepth::Minimal,
            subject_coverage: vec!["botany".into()],
            content_quality: ContentQuality::Medium,
            concept_coverage: vec![],
            knowledge_gaps: vec![],
            recommended_objectives: vec!["Describe photosynthesis".into()],
            recommended_generation_mode: GenerationMode::KbSupplemented,
        }
    }

    #[test]
    fn draft_accepts_camel_case_and_fills_gaps() {
        let raw = r#"{"courseTitle":"","modules":[{"title":"Roots","lessons":[
            {"lessonTitle":"Water uptake","contentType":"Lab","estimatedDurationHours":-1,
             "contentOutline":["Osmosis"],"sourceReferences":"chunk-1"}]}]}"#;
        let (draft, _) = parse_structured::<OutlineDraft>(raw).unwrap();
        let req = request(1, 1);
        let (outline, refs) = draft.into_outline(&req, &analysis(), GenerationMode::KbPriority);
        assert_eq!(outline.title, "Plant Biology");
        assert_eq!(outline.learning_objectives, vec!["Describe photosynthesis"]);
        let lesson = &outline.modules[0].lessons[0];
        assert_eq!(lesson.title, "Water uptake");
        assert_eq!(lesson.content_type, ContentType::Lab);
        assert_eq!(lesson.estimated_duration_hours, 1.0);
        assert_eq!(refs[0][0], vec!["chunk-1"]);
    }

    #[test]
    fn numeric_fields_tolerate_floats_and_strings() {
        let raw = r#"{"modules":[{"title":"W1","duration_weeks":1.0,"lessons":[
            {"title":"L","estimated_duration_hours":"1.5"},
            {"title":"M","estimatedDurationHours":"about two"}]}]}"#;
        let (draft, _) = parse_structured::<OutlineDraft>(raw).unwrap();
        assert_eq!(draft.modules[0].duration_weeks, Some(1));
        assert_eq!(draft.modules[0].lessons[0].estimated_duration_hours, Some(1.5));
        assert_eq!(draft.modules[0].lessons[1].estimated_duration_hours, None);

        let (outline, _) =
            draft.into_outline(&request(1, 2), &analysis(), GenerationMode::KbPriority);
        assert_eq!(outline.modules[0].duration_weeks, 1);
        assert_eq!(outline.modules[0].lessons[0].estimated_duration_hours, 1.5);
    }

    #[test]
    fn outline_without_modules_is_unusable() {
        assert!(parse_structured::<OutlineDraft>(r#"{"title":"x","modules":[]}"#).is_none());
    }

    #[test]
    fn finalize_enforces_shape_and_real_references() {
        let raw = r#"{"modules":[{"title":"Week A","lessons":[{"title":"L1"},{"title":"L2"},{"title":"L3"}]}]}"#;
        let (draft, _) = parse_structured::<OutlineDraft>(raw).unwrap();
        let req = request(2, 2);
        let (mut outline, raw_refs) = draft.into_outline(&req, &analysis(), GenerationMode::KbOnly);
        let known: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        finalize_outline(&mut outline, &raw_refs, 2, 2, &known);

        assert_eq!(outline.modules.len(), 2);
        assert!(outline.modules.iter().all(|m| m.lessons.len() == 2));
        assert!(outline.is_densely_ordered());
        for lesson in outline.modules.iter().flat_map(|m| &m.lessons) {
            assert!(!lesson.source_references.is_empty());
            assert!(lesson.source_references.iter().all(|r| known.contains(r)));
        }
    }

    #[test]
    fn prompt_states_exact_structure() {
        let req = request(3, 2);
        let prompt = outline_prompt(&req, &analysis(), GenerationMode::KbOnly, &[]);
        assert!(prompt.contains("exactly 3 modules"));
        assert!(prompt.contains("exactly 2 lessons"));
        assert!(prompt.contains("ONLY"));
    }
}
