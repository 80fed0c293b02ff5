//! Instruction tables injected into generation prompts, keyed by academic
//! level, lesson detail level and generation mode.

use crate::models::{AcademicLevel, DetailLevel, GenerationMode};

pub fn academic_level_guidance(level: AcademicLevel) -> &'static str {
    match level {
        AcademicLevel::Kindergarten => {
            "Audience: ages 4-6. Use very short sentences, concrete everyday objects, \
             playful repetition and no abstract terminology. One idea at a time."
        }
        AcademicLevel::Elementary => {
            "Audience: ages 6-11. Use simple vocabulary, relatable examples from school \
             and home, and explain every new word the first time it appears."
        }
        AcademicLevel::MiddleSchool => {
            "Audience: ages 11-14. Introduce subject terminology with definitions, connect \
             ideas to real-world situations and encourage simple reasoning steps."
        }
        AcademicLevel::HighSchool => {
            "Audience: ages 14-18. Use discipline vocabulary, multi-step explanations, \
             worked examples and questions that require applying concepts."
        }
        AcademicLevel::College => {
            "Audience: undergraduates. Assume general literacy in the field, explain \
             theory alongside application, cite underlying principles and trade-offs."
        }
        AcademicLevel::Graduate => {
            "Audience: graduate students. Engage with nuance, competing models and \
             limitations; emphasise analysis, synthesis and critical evaluation."
        }
        AcademicLevel::Professional => {
            "Audience: working professionals. Focus on practical application, workplace \
             scenarios, decision criteria and common pitfalls in practice."
        }
        AcademicLevel::MasterClass => {
            "Audience: experts. Assume mastery of fundamentals; concentrate on advanced \
             techniques, edge cases, expert heuristics and open problems."
        }
    }
}

pub fn detail_level_guidance(level: DetailLevel) -> &'static str {
    match level {
        DetailLevel::Basic => {
            "Detail: concise. Cover the essential ideas of each section with one example \
             and a short summary."
        }
        DetailLevel::Detailed => {
            "Detail: thorough. Explain each concept step by step with at least two \
             examples, common misconceptions and comprehension checks."
        }
        DetailLevel::Comprehensive => {
            "Detail: exhaustive. Provide in-depth explanations, multiple worked examples, \
             misconceptions with corrections, comprehension checks and connections to \
             related topics."
        }
    }
}

pub fn generation_mode_instructions(mode: GenerationMode) -> &'static str {
    match mode {
        GenerationMode::KbOnly => {
            "Use ONLY information present in the provided knowledge base content. Do not \
             add facts, examples or claims from outside knowledge. If the knowledge base \
             does not cover something, leave it out."
        }
        GenerationMode::KbPriority => {
            "Ground content primarily in the provided knowledge base content. You may add \
             general knowledge only to fill small gaps (no more than about a quarter of \
             the material), and it must stay consistent with the knowledge base."
        }
        GenerationMode::KbSupplemented => {
            "Use the provided knowledge base content as the foundation and freely \
             supplement it with accurate general knowledge, examples and context."
        }
    }
}

pub fn sections_per_lesson(level: DetailLevel) -> usize {
    match level {
        DetailLevel::Basic => 3,
        DetailLevel::Detailed => 4,
        DetailLevel::Comprehensive => 5,
    }
}

/// Approximate word count for a section's main teaching content.
pub fn section_word_target(level: DetailLevel) -> usize {
    match level {
        DetailLevel::Basic => 250,
        DetailLevel::Detailed => 500,
        DetailLevel::Comprehensive => 800,
    }
}

/// Assembles a prompt from labelled blocks in insertion order.
#[derive(Debug, Default, Clone)]
pub struct PromptBuilder {
    blocks: Vec<(String, String)>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(mut self, label: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        if !body.trim().is_empty() {
            self.blocks.push((label.into(), body));
        }
        self
    }

    pub fn list(self, label: impl Into<String>, items: &[String]) -> Self {
        let body = items
            .iter()
            .filter(|i| !i.trim().is_empty())
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.block(label, body)
    }

    pub fn guidance(self, level: AcademicLevel, detail: DetailLevel, mode: GenerationMode) -> Self {
        self.block("ACADEMIC LEVEL", academic_level_guidance(level))
            .block("DETAIL LEVEL", detail_level_guidance(detail))
            .block("CONTENT SOURCE RULES", generation_mode_instructions(mode))
    }

    pub fn build(self) -> String {
        self.blocks
            .into_iter()
            .map(|(label, body)| format!("## {label}\n{body}"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_level_has_guidance() {
        for level in AcademicLevel::ALL {
            assert!(!academic_level_guidance(*level).is_empty());
        }
        for level in DetailLevel::ALL {
            assert!(!detail_level_guidance(*level).is_empty());
        }
    }

    #[test]
    fn detail_scales_sections_and_words() {
        let basic = sections_per_lesson(DetailLevel::Basic);
        assert!(basic < sections_per_lesson(DetailLevel::Comprehensive));
        assert!(
            section_word_target(DetailLevel::Basic) < section_word_target(DetailLevel::Detailed)
        );
    }

    #[test]
    fn kb_only_forbids_outside_knowledge() {
        assert!(generation_mode_instructions(GenerationMode::KbOnly).contains("ONLY"));
    }

    #[test]
    fn builder_skips_empty_blocks_and_keeps_order() {
        let prompt = PromptBuilder::new()
            .block("A", "first")
            .block("EMPTY", "  ")
            .list("LIST", &["x".to_string(), "".to_string()])
            .block("B", "second")
            .build();
        assert_eq!(prompt, "## A\nfirst\n\n## LIST\n- x\n\n## B\nsecond");
    }
}
