//! Typed shapes of model responses for lesson content and assessments.
//!
//! Models drift between snake_case and camelCase keys and between strings and
//! lists for prose fields, so deserialization is deliberately forgiving. All
//! downstream code works on these structs, never on raw JSON.

use serde::{Deserialize, Deserializer};

use crate::engine::{FallbackHint, StructuredOutput};
use crate::models::{Difficulty, QuestionType, SectionContent};

/// Prose that may arrive as a string, a list of strings or objects.
pub(crate) fn text_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(flatten_text(&v))
}

fn flatten_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(flatten_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        serde_json::Value::Object(map) => map
            .values()
            .map(flatten_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// A list that may arrive as a single string or a list of mixed values.
pub(crate) fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(flatten_text)
            .filter(|s| !s.trim().is_empty())
            .collect(),
        other => {
            let s = flatten_text(&other);
            if s.trim().is_empty() {
                Vec::new()
            } else {
                vec![s]
            }
        }
    })
}

/// Numbers that may arrive as integers, floats or numeric strings. Anything
/// else, including a value out of the target range, reads as absent.
pub(crate) fn lenient_number<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: LenientNumber,
{
    let v = serde_json::Value::deserialize(d)?;
    let n = match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(n.filter(|n| n.is_finite()).and_then(T::from_f64))
}

pub(crate) trait LenientNumber: Sized {
    fn from_f64(n: f64) -> Option<Self>;
}

impl LenientNumber for f32 {
    fn from_f64(n: f64) -> Option<Self> {
        Some(n as f32)
    }
}

impl LenientNumber for u32 {
    fn from_f64(n: f64) -> Option<Self> {
        let n = n.round();
        (0.0..=u32::MAX as f64).contains(&n).then_some(n as u32)
    }
}

impl LenientNumber for i32 {
    fn from_f64(n: f64) -> Option<Self> {
        let n = n.round();
        (i32::MIN as f64..=i32::MAX as f64).contains(&n).then_some(n as i32)
    }
}

/// Answers arrive as strings, numbers, booleans or lists.
fn answer_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Array(items) => items
            .iter()
            .map(flatten_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => flatten_text(&other),
    })
}

// --- lesson sections ---

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeneratedSection {
    #[serde(default, alias = "sectionTitle", alias = "section_title", alias = "name")]
    pub title: String,
    #[serde(default, deserialize_with = "text_or_list")]
    pub introduction: String,
    #[serde(
        default,
        alias = "mainContent",
        alias = "main_teaching_content",
        alias = "mainTeachingContent",
        alias = "content",
        deserialize_with = "text_or_list"
    )]
    pub main_content: String,
    #[serde(default, deserialize_with = "string_list")]
    pub examples: Vec<String>,
    #[serde(
        default,
        alias = "commonMisconceptions",
        alias = "common_misconceptions",
        deserialize_with = "string_list"
    )]
    pub misconceptions: Vec<String>,
    #[serde(
        default,
        alias = "comprehensionChecks",
        alias = "checkForUnderstanding",
        deserialize_with = "string_list"
    )]
    pub comprehension_checks: Vec<String>,
    #[serde(default, alias = "keyTakeaways", deserialize_with = "text_or_list")]
    pub summary: String,
}

impl GeneratedSection {
    pub fn has_body(&self) -> bool {
        !self.introduction.trim().is_empty() || !self.main_content.trim().is_empty()
    }

    pub fn into_content(self) -> (String, SectionContent) {
        (
            self.title,
            SectionContent {
                introduction: self.introduction,
                main_content: self.main_content,
                examples: self.examples,
                misconceptions: self.misconceptions,
                comprehension_checks: self.comprehension_checks,
                summary: self.summary,
            },
        )
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LessonSectionsPayload {
    #[serde(default, alias = "lessonSections", alias = "lesson_sections")]
    pub sections: Vec<GeneratedSection>,
}

impl StructuredOutput for LessonSectionsPayload {
    const SHAPE: &'static str = "lesson_sections";

    fn fallback(hint: &FallbackHint) -> Self {
        let titles: Vec<String> = if hint.section_titles.is_empty() {
            vec![hint.lesson_title.clone()]
        } else {
            hint.section_titles.clone()
        };
        let objectives = if hint.learning_objectives.is_empty() {
            String::new()
        } else {
            format!(" Objectives: {}.", hint.learning_objectives.join("; "))
        };
        let sections = titles
            .into_iter()
            .map(|title| GeneratedSection {
                introduction: format!(
                    "This section of \"{}\" introduces {}.",
                    hint.lesson_title, title
                ),
                main_content: format!(
                    "Content for \"{title}\" is being prepared. Review the lesson resources \
                     for this topic.{objectives}"
                ),
                summary: format!("Key points of {title} will be summarized here."),
                title,
                ..Default::default()
            })
            .collect();
        LessonSectionsPayload { sections }
    }

    fn is_usable(&self) -> bool {
        !self.sections.is_empty() && self.sections.iter().all(GeneratedSection::has_body)
    }
}

// --- questions ---

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeneratedQuestion {
    #[serde(default, alias = "questionText", alias = "question", alias = "text")]
    pub question_text: String,
    #[serde(default, alias = "questionType", alias = "type")]
    pub question_type: String,
    #[serde(default, alias = "choices", deserialize_with = "string_list")]
    pub options: Vec<String>,
    #[serde(default, alias = "correctAnswer", alias = "answer", deserialize_with = "answer_text")]
    pub correct_answer: String,
    #[serde(default, alias = "rationale")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub points: Option<i32>,
    #[serde(
        default,
        alias = "learningObjectives",
        alias = "learning_objective",
        alias = "learningObjective",
        deserialize_with = "string_list"
    )]
    pub learning_objectives: Vec<String>,
    /// Title of the section the question was drawn from.
    #[serde(default, alias = "sourceSection", alias = "source_section_title")]
    pub source_section: Option<String>,
}

impl GeneratedQuestion {
    pub fn kind(&self) -> QuestionType {
        QuestionType::from_lenient(&self.question_type).unwrap_or(if self.options.len() >= 2 {
            QuestionType::MultipleChoice
        } else {
            QuestionType::ShortAnswer
        })
    }

    pub fn difficulty(&self) -> Difficulty {
        Difficulty::from_lenient(&self.difficulty).unwrap_or(Difficulty::Medium)
    }

    pub fn points(&self) -> i32 {
        self.points.filter(|p| *p > 0).unwrap_or(match self.kind() {
            QuestionType::Essay => 5,
            QuestionType::ShortAnswer => 2,
            QuestionType::MultipleChoice | QuestionType::TrueFalse => 1,
        })
    }

    /// Multiple choice needs options and an answer; every question needs text.
    pub fn is_valid(&self) -> bool {
        if self.question_text.trim().is_empty() {
            return false;
        }
        match self.kind() {
            QuestionType::MultipleChoice => {
                self.options.len() >= 2 && !self.correct_answer.trim().is_empty()
            }
            QuestionType::TrueFalse => !self.correct_answer.trim().is_empty(),
            QuestionType::ShortAnswer | QuestionType::Essay => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QuestionsPayload {
    #[serde(default, alias = "assessmentQuestions", alias = "items")]
    pub questions: Vec<GeneratedQuestion>,
}

impl StructuredOutput for QuestionsPayload {
    const SHAPE: &'static str = "questions";

    /// One reflective short-answer question per taught section.
    fn fallback(hint: &FallbackHint) -> Self {
        let titles: Vec<String> = if hint.section_titles.is_empty() {
            vec![hint.lesson_title.clone()]
        } else {
            hint.section_titles.clone()
        };
        let questions = titles
            .into_iter()
            .map(|title| GeneratedQuestion {
                question_text: format!(
                    "In your own words, explain the main ideas covered in \"{title}\"."
                ),
                question_type: QuestionType::ShortAnswer.as_str().to_string(),
                correct_answer: format!("Answers should restate the key points of {title}."),
                difficulty: Difficulty::Easy.as_str().to_string(),
                points: Some(2),
                learning_objectives: hint.learning_objectives.clone(),
                source_section: Some(title),
                ..Default::default()
            })
            .collect();
        QuestionsPayload { questions }
    }

    fn is_usable(&self) -> bool {
        self.questions.iter().any(GeneratedQuestion::is_valid)
    }
}
