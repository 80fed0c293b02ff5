//! Course outline types and the structural rules every outline obeys before it
//! is persisted: exact module/lesson counts, dense 1..N ordering, and source
//! references that point at real knowledge-base chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    AcademicLevel, AssessmentSettings, DetailLevel, GenerationMode, KnowledgeBaseAnalysis,
};

text_enum! {
    pub enum ContentType {
        Lecture => "lecture",
        Activity => "activity",
        Discussion => "discussion",
        Reading => "reading",
        Lab => "lab",
    }
}

text_enum! {
    pub enum OutlineStatus {
        Draft => "draft",
        Approved => "approved",
        Published => "published",
        Archived => "archived",
    }
}

text_enum! {
    pub enum ModuleAssessmentType {
        Quiz => "quiz",
        Assignment => "assignment",
        Project => "project",
    }
}

/// Default topics for a lesson whose content outline came back empty.
pub const DEFAULT_CONTENT_OUTLINE: [&str; 3] = ["Introduction", "Core Concepts", "Summary"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleLesson {
    pub title: String,
    pub description: String,
    pub order: u32,
    pub estimated_duration_hours: f32,
    pub content_type: ContentType,
    pub learning_objectives: Vec<String>,
    pub content_outline: Vec<String>,
    pub required_resources: Vec<String>,
    pub source_references: Vec<Uuid>,
}

impl ModuleLesson {
    pub fn placeholder(module_order: u32, order: u32) -> Self {
        ModuleLesson {
            title: format!("Week {module_order} Lesson {order}"),
            description: String::new(),
            order,
            estimated_duration_hours: 1.0,
            content_type: ContentType::Lecture,
            learning_objectives: Vec::new(),
            content_outline: DEFAULT_CONTENT_OUTLINE.iter().map(|s| s.to_string()).collect(),
            required_resources: Vec::new(),
            source_references: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleAssessment {
    pub title: String,
    pub assessment_type: ModuleAssessmentType,
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Module {
    pub title: String,
    pub description: String,
    pub order: u32,
    pub duration_weeks: u32,
    pub learning_objectives: Vec<String>,
    pub lessons: Vec<ModuleLesson>,
    pub assessments: Vec<ModuleAssessment>,
}

impl Module {
    pub fn placeholder(order: u32) -> Self {
        Module {
            title: format!("Week {order}"),
            description: String::new(),
            order,
            duration_weeks: 1,
            learning_objectives: Vec::new(),
            lessons: Vec::new(),
            assessments: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CourseOutline {
    pub title: String,
    pub description: String,
    pub generation_mode: GenerationMode,
    pub learning_objectives: Vec<String>,
    pub estimated_duration_weeks: u32,
    pub modules: Vec<Module>,
    pub kb_analysis: KnowledgeBaseAnalysis,
    pub status: OutlineStatus,
    pub academic_level: AcademicLevel,
    pub lesson_detail_level: DetailLevel,
    pub target_audience: Option<String>,
    pub prerequisites: Option<String>,
    pub lessons_per_week: u32,
    pub assessment_settings: AssessmentSettings,
}

impl CourseOutline {
    pub fn lesson_count(&self) -> usize {
        self.modules.iter().map(|m| m.lessons.len()).sum()
    }

    /// Pads or truncates modules and lessons to the requested shape, then
    /// renumbers every `order` densely from 1 in array order.
    pub fn enforce_structure(&mut self, weeks: u32, lessons_per_week: u32) {
        self.modules.truncate(weeks as usize);
        while self.modules.len() < weeks as usize {
            let order = self.modules.len() as u32 + 1;
            self.modules.push(Module::placeholder(order));
        }
        self.estimated_duration_weeks = weeks;
        self.lessons_per_week = lessons_per_week;

        for (mi, module) in self.modules.iter_mut().enumerate() {
            module.order = mi as u32 + 1;
            if module.duration_weeks == 0 {
                module.duration_weeks = 1;
            }
            module.lessons.truncate(lessons_per_week as usize);
            while module.lessons.len() < lessons_per_week as usize {
                let order = module.lessons.len() as u32 + 1;
                module.lessons.push(ModuleLesson::placeholder(module.order, order));
            }
            for (li, lesson) in module.lessons.iter_mut().enumerate() {
                lesson.order = li as u32 + 1;
                lesson.content_outline.retain(|t| !t.trim().is_empty());
                if lesson.content_outline.is_empty() {
                    lesson.content_outline =
                        DEFAULT_CONTENT_OUTLINE.iter().map(|s| s.to_string()).collect();
                }
            }
        }
    }

    /// True when every module and lesson `order` is dense from 1.
    pub fn is_densely_ordered(&self) -> bool {
        self.modules.iter().enumerate().all(|(mi, m)| {
            m.order == mi as u32 + 1
                && m.lessons
                    .iter()
                    .enumerate()
                    .all(|(li, l)| l.order == li as u32 + 1)
        })
    }
}

/// An outline as persisted, with the request context it was generated for.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredOutline {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub organization_id: Uuid,
    pub created_by: Uuid,
    pub outline: CourseOutline,
    pub created_at: DateTime<Utc>,
}

/// Strict identifier check: only the canonical hyphenated UUID form is
/// trusted as a cross-reference.
pub fn parse_strict_uuid(raw: &str) -> Option<Uuid> {
    let raw = raw.trim();
    if raw.len() != 36 {
        return None;
    }
    let bytes = raw.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        let ok = match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        };
        if !ok {
            return None;
        }
    }
    Uuid::parse_str(raw).ok()
}

pub const REFERENCES_PER_LESSON: usize = 3;

/// Hands out known chunk ids round-robin, wrapping when exhausted.
pub struct ReferenceDistributor<'a> {
    ids: &'a [Uuid],
    cursor: usize,
}

impl<'a> ReferenceDistributor<'a> {
    pub fn new(ids: &'a [Uuid]) -> Self {
        ReferenceDistributor { ids, cursor: 0 }
    }

    pub fn take(&mut self, n: usize) -> Vec<Uuid> {
        if self.ids.is_empty() {
            return Vec::new();
        }
        let n = n.min(self.ids.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.ids[self.cursor % self.ids.len()]);
            self.cursor += 1;
        }
        out
    }
}

/// Resolves one lesson's raw references. Valid ids of known chunks are kept;
/// everything else is replaced by distributed ids so each lesson ends up with
/// between one and `REFERENCES_PER_LESSON` real references (when any exist).
pub fn reconcile_references(
    raw: &[String],
    known: &[Uuid],
    distributor: &mut ReferenceDistributor<'_>,
) -> Vec<Uuid> {
    let mut kept: Vec<Uuid> = Vec::new();
    for r in raw {
        if let Some(id) = parse_strict_uuid(r) {
            if known.contains(&id) && !kept.contains(&id) {
                kept.push(id);
            }
        }
    }
    let wanted = raw.len().clamp(1, REFERENCES_PER_LESSON);
    if kept.len() < wanted {
        for id in distributor.take(wanted - kept.len()) {
            if !kept.contains(&id) {
                kept.push(id);
            }
        }
    }
    kept.truncate(REFERENCES_PER_LESSON);
    kept
}
