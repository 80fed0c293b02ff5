use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    /// How strictly generated content must stay inside the knowledge base.
    pub enum GenerationMode {
        KbOnly => "kb_only",
        KbPriority => "kb_priority",
        KbSupplemented => "kb_supplemented",
    }
}

text_enum! {
    pub enum ContentDepth {
        Minimal => "minimal",
        Moderate => "moderate",
        Comprehensive => "comprehensive",
    }
}

text_enum! {
    pub enum ContentQuality {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

text_enum! {
    pub enum AcademicLevel {
        Kindergarten => "kindergarten",
        Elementary => "elementary",
        MiddleSchool => "middle_school",
        HighSchool => "high_school",
        College => "college",
        Graduate => "graduate",
        Professional => "professional",
        MasterClass => "master_class",
    }
}

text_enum! {
    pub enum DetailLevel {
        Basic => "basic",
        Detailed => "detailed",
        Comprehensive => "comprehensive",
    }
}

// --- knowledge base ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KbDocument {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub file_name: String,
    pub summary: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl KbDocument {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KbChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
}

/// A chunk returned by retrieval, with the similarity that ranked it.
/// Sampled (non-vector) chunks carry a similarity of 0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub similarity: f64,
}

impl From<KbChunk> for RetrievedChunk {
    fn from(c: KbChunk) -> Self {
        RetrievedChunk {
            id: c.id,
            document_id: c.document_id,
            content: c.content,
            similarity: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KnowledgeBaseAnalysis {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub average_chunks_per_document: f64,
    pub content_depth: ContentDepth,
    pub subject_coverage: Vec<String>,
    pub content_quality: ContentQuality,
    pub concept_coverage: Vec<String>,
    pub knowledge_gaps: Vec<String>,
    pub recommended_objectives: Vec<String>,
    pub recommended_generation_mode: GenerationMode,
}

// --- request ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AssessmentSettings {
    pub questions_per_lesson: u32,
    pub questions_per_quiz: u32,
    pub questions_per_exam: u32,
    pub quiz_time_limit_minutes: i32,
    pub exam_time_limit_minutes: i32,
    pub passing_score_percentage: i32,
}

impl Default for AssessmentSettings {
    fn default() -> Self {
        AssessmentSettings {
            questions_per_lesson: 5,
            questions_per_quiz: 10,
            questions_per_exam: 20,
            quiz_time_limit_minutes: 30,
            exam_time_limit_minutes: 90,
            passing_score_percentage: 70,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CourseGenerationRequest {
    pub knowledge_base_id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub duration_weeks: u32,
    pub lessons_per_week: u32,
    pub academic_level: AcademicLevel,
    pub lesson_detail_level: DetailLevel,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub prerequisites: Option<String>,
    #[serde(default = "default_true")]
    pub include_assessments: bool,
    #[serde(default = "default_true")]
    pub include_quizzes: bool,
    #[serde(default)]
    pub include_final_exam: bool,
    /// Overrides the mode recommended by knowledge-base analysis.
    #[serde(default)]
    pub generation_mode: Option<GenerationMode>,
    #[serde(default)]
    pub assessment_settings: AssessmentSettings,
}

fn default_true() -> bool {
    true
}

pub const MAX_DURATION_WEEKS: u32 = 52;
pub const MAX_LESSONS_PER_WEEK: u32 = 7;

impl CourseGenerationRequest {
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title must not be empty".into());
        }
        if !(1..=MAX_DURATION_WEEKS).contains(&self.duration_weeks) {
            return Err(format!(
                "duration_weeks must be between 1 and {MAX_DURATION_WEEKS}"
            ));
        }
        if !(1..=MAX_LESSONS_PER_WEEK).contains(&self.lessons_per_week) {
            return Err(format!(
                "lessons_per_week must be between 1 and {MAX_LESSONS_PER_WEEK}"
            ));
        }
        let pass = self.assessment_settings.passing_score_percentage;
        if !(0..=100).contains(&pass) {
            return Err("passing_score_percentage must be between 0 and 100".into());
        }
        Ok(())
    }

    pub fn total_lessons(&self) -> u32 {
        self.duration_weeks * self.lessons_per_week
    }
}

// --- materialized entities ---

text_enum! {
    pub enum SectionType {
        Introduction => "introduction",
        MainContent => "main_content",
        Summary => "summary",
        Activity => "activity",
    }
}

impl SectionType {
    /// Type of the section at `index` in a lesson with `count` sections.
    pub fn for_position(index: usize, count: usize) -> SectionType {
        if index == 0 {
            SectionType::Introduction
        } else if index + 1 == count {
            SectionType::Summary
        } else {
            SectionType::MainContent
        }
    }
}

text_enum! {
    /// Whether persisted content came from the model or from a placeholder.
    pub enum Provenance {
        Generated => "generated",
        Fallback => "fallback",
    }
}

text_enum! {
    pub enum QuestionType {
        MultipleChoice => "multiple_choice",
        TrueFalse => "true_false",
        ShortAnswer => "short_answer",
        Essay => "essay",
    }
}

text_enum! {
    pub enum Difficulty {
        Easy => "easy",
        Medium => "medium",
        Hard => "hard",
    }
}

text_enum! {
    pub enum QuizKind {
        ModuleQuiz => "module_quiz",
        Exam => "exam",
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Path {
    pub id: Uuid,
    pub outline_id: Uuid,
    pub organization_id: Uuid,
    pub title: String,
    pub description: String,
    pub order_index: i32,
    pub published: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Lesson {
    pub id: Uuid,
    pub path_id: Uuid,
    pub title: String,
    pub description: String,
    pub order_index: i32,
    pub estimated_duration_hours: f32,
    pub content_type: crate::outline::ContentType,
    pub learning_objectives: Vec<String>,
    pub source_references: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Structured body of one lesson section.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SectionContent {
    pub introduction: String,
    pub main_content: String,
    pub examples: Vec<String>,
    pub misconceptions: Vec<String>,
    pub comprehension_checks: Vec<String>,
    pub summary: String,
}

impl SectionContent {
    /// Flattened text used to ground assessments.
    pub fn plain_text(&self) -> String {
        let mut parts: Vec<&str> = vec![self.introduction.as_str(), self.main_content.as_str()];
        parts.extend(self.examples.iter().map(String::as_str));
        parts.extend(self.misconceptions.iter().map(String::as_str));
        parts.extend(self.comprehension_checks.iter().map(String::as_str));
        parts.push(self.summary.as_str());
        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LessonSection {
    pub id: Uuid,
    pub lesson_id: Uuid,
    pub title: String,
    pub content: SectionContent,
    pub section_type: SectionType,
    pub order_index: i32,
    pub provenance: Provenance,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub lesson_id: Option<Uuid>,
    pub quiz_id: Option<Uuid>,
    pub question_text: String,
    pub question_type: QuestionType,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub explanation: Option<String>,
    pub points: i32,
    pub difficulty: Difficulty,
    pub learning_objectives: Vec<String>,
    pub provenance: Provenance,
    pub order_index: i32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Quiz {
    pub id: Uuid,
    pub outline_id: Uuid,
    /// `None` for the course-wide final exam.
    pub path_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub assessment_type: QuizKind,
    pub time_limit_minutes: i32,
    pub passing_score_percentage: i32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CourseGenerationRequest {
        serde_json::from_value(serde_json::json!({
            "knowledge_base_id": Uuid::new_v4(),
            "organization_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "title": "Intro to Botany",
            "duration_weeks": 2,
            "lessons_per_week": 1,
            "academic_level": "high_school",
            "lesson_detail_level": "basic"
        }))
        .unwrap()
    }

    #[test]
    fn request_defaults_apply() {
        let req = request();
        assert!(req.include_assessments);
        assert!(req.include_quizzes);
        assert!(!req.include_final_exam);
        assert_eq!(req.generation_mode, None);
        assert_eq!(req.assessment_settings, AssessmentSettings::default());
        assert_eq!(req.total_lessons(), 2);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn request_validation_rejects_out_of_range() {
        let mut req = request();
        req.duration_weeks = 0;
        assert!(req.validate().unwrap_err().contains("duration_weeks"));

        let mut req = request();
        req.lessons_per_week = 8;
        assert!(req.validate().unwrap_err().contains("lessons_per_week"));

        let mut req = request();
        req.title = "   ".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn section_types_follow_position() {
        assert_eq!(SectionType::for_position(0, 1), SectionType::Introduction);
        let types: Vec<_> = (0..4).map(|i| SectionType::for_position(i, 4)).collect();
        assert_eq!(
            types,
            vec![
                SectionType::Introduction,
                SectionType::MainContent,
                SectionType::MainContent,
                SectionType::Summary
            ]
        );
        assert_eq!(SectionType::for_position(1, 2), SectionType::Summary);
    }

    #[test]
    fn plain_text_skips_empty_parts() {
        let content = SectionContent {
            introduction: "Plants make food.".into(),
            main_content: "  ".into(),
            examples: vec!["A leaf".into()],
            summary: "Done.".into(),
            ..Default::default()
        };
        assert_eq!(content.plain_text(), "Plants make food.\nA leaf\nDone.");
    }
}
