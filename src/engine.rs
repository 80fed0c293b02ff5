//! Content generation engine: one completion call in JSON mode, then an
//! ordered list of parse attempts. Each attempt either yields a usable typed
//! value or passes to the next; the last resort is the shape's own fallback
//! constructor, so malformed model output never escapes this module.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::models::Provenance;
use crate::provider::{CompletionOptions, ModelProvider, ProviderError};

/// Titles and objectives used to build placeholder content when the model's
/// output cannot be used.
#[derive(Debug, Clone, Default)]
pub struct FallbackHint {
    pub lesson_title: String,
    pub section_titles: Vec<String>,
    pub learning_objectives: Vec<String>,
}

/// A JSON shape the engine can produce.
pub trait StructuredOutput: DeserializeOwned + Send + Sized {
    /// Name used in logs.
    const SHAPE: &'static str;

    fn fallback(hint: &FallbackHint) -> Self;

    /// A value that deserialized but carries nothing useful (for example an
    /// empty section list) counts as a parse failure.
    fn is_usable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Strict,
    CodeFence,
    BalancedExtract,
    ClosedTruncation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Parsed(ParseStrategy),
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Generated<T> {
    pub value: T,
    pub outcome: Outcome,
}

impl<T> Generated<T> {
    pub fn provenance(&self) -> Provenance {
        match self.outcome {
            Outcome::Parsed(_) => Provenance::Generated,
            Outcome::Fallback => Provenance::Fallback,
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("model output for {shape} could not be parsed: {preview}")]
    Unparseable { shape: &'static str, preview: String },
}

type Candidate = fn(&str) -> Option<String>;

const PARSE_ATTEMPTS: [(ParseStrategy, Candidate); 4] = [
    (ParseStrategy::Strict, strict_candidate),
    (ParseStrategy::CodeFence, strip_code_fences),
    (ParseStrategy::BalancedExtract, balanced_extract),
    (ParseStrategy::ClosedTruncation, close_truncated),
];

/// Tries every parse strategy in order; `None` when all of them fail.
pub fn parse_structured<T: StructuredOutput>(raw: &str) -> Option<(T, ParseStrategy)> {
    PARSE_ATTEMPTS.iter().find_map(|(strategy, candidate)| {
        let text = candidate(raw)?;
        let value: T = serde_json::from_str(&text).ok()?;
        value.is_usable().then_some((value, *strategy))
    })
}

/// Parse attempts plus the guaranteed fallback.
pub fn parse_or_fallback<T: StructuredOutput>(raw: &str, hint: &FallbackHint) -> Generated<T> {
    match parse_structured::<T>(raw) {
        Some((value, strategy)) => {
            if strategy != ParseStrategy::Strict {
                tracing::debug!(shape = T::SHAPE, ?strategy, "model output repaired");
            }
            Generated {
                value,
                outcome: Outcome::Parsed(strategy),
            }
        }
        None => {
            tracing::warn!(
                shape = T::SHAPE,
                lesson = %hint.lesson_title,
                raw = %preview(raw),
                "unparseable model output; using fallback content"
            );
            Generated {
                value: T::fallback(hint),
                outcome: Outcome::Fallback,
            }
        }
    }
}

fn preview(raw: &str) -> String {
    const MAX: usize = 400;
    if raw.chars().count() <= MAX {
        raw.to_string()
    } else {
        let head: String = raw.chars().take(MAX).collect();
        format!("{head}…")
    }
}

#[derive(Clone)]
pub struct ContentEngine {
    provider: Arc<dyn ModelProvider>,
}

impl ContentEngine {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        ContentEngine { provider }
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    /// Never fails on bad output; only transport errors propagate.
    pub async fn generate_structured<T: StructuredOutput>(
        &self,
        system: &str,
        prompt: &str,
        hint: &FallbackHint,
        options: &CompletionOptions,
    ) -> Result<Generated<T>, ProviderError> {
        let raw = self.provider.complete(system, prompt, options).await?;
        Ok(parse_or_fallback(&raw, hint))
    }

    /// No fallback: unusable output is an error.
    pub async fn generate_strict<T: StructuredOutput>(
        &self,
        system: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<(T, ParseStrategy), EngineError> {
        let raw = self.provider.complete(system, prompt, options).await?;
        parse_structured::<T>(&raw).ok_or_else(|| EngineError::Unparseable {
            shape: T::SHAPE,
            preview: preview(&raw),
        })
    }
}

// --- parse candidates ---

fn strict_candidate(raw: &str) -> Option<String> {
    Some(raw.trim().to_string())
}

/// Body of the first ``` fenced block, with any language tag dropped.
fn strip_code_fences(raw: &str) -> Option<String> {
    let start = raw.find("```")?;
    let after = &raw[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    let body = body.trim();
    (!body.is_empty()).then(|| body.to_string())
}

struct Scan {
    start: usize,
    /// Byte offset just past the first complete top-level value.
    complete_end: Option<usize>,
    open: Vec<char>,
    in_string: bool,
}

fn scan_json(raw: &str) -> Option<Scan> {
    let start = raw.find(['{', '['])?;
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                if open.pop() != Some(ch) {
                    return None;
                }
                if open.is_empty() {
                    return Some(Scan {
                        start,
                        complete_end: Some(start + i + 1),
                        open,
                        in_string,
                    });
                }
            }
            _ => {}
        }
    }
    Some(Scan {
        start,
        complete_end: None,
        open,
        in_string,
    })
}

/// The first balanced object or array, dropping any prose around it.
fn balanced_extract(raw: &str) -> Option<String> {
    let scan = scan_json(raw)?;
    let end = scan.complete_end?;
    Some(raw[scan.start..end].to_string())
}

/// Repairs output cut off mid-stream by closing the open string and brackets.
fn close_truncated(raw: &str) -> Option<String> {
    let scan = scan_json(raw)?;
    if scan.complete_end.is_some() || scan.open.is_empty() {
        return None;
    }
    let mut text = raw[scan.start..].trim_end().to_string();
    if scan.in_string {
        if text.ends_with('\\') {
            text.pop();
        }
        text.push('"');
    }
    loop {
        let trimmed = text.trim_end();
        if let Some(stripped) = trimmed.strip_suffix(',') {
            text = stripped.to_string();
        } else if trimmed.ends_with(':') {
            text = format!("{trimmed} null");
            break;
        } else {
            text = trimmed.to_string();
            break;
        }
    }
    for closer in scan.open.iter().rev() {
        text.push(*closer);
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Titles {
        #[serde(default)]
        titles: Vec<String>,
    }

    impl StructuredOutput for Titles {
        const SHAPE: &'static str = "titles";

        fn fallback(hint: &FallbackHint) -> Self {
            Titles {
                titles: hint.section_titles.clone(),
            }
        }

        fn is_usable(&self) -> bool {
            !self.titles.is_empty()
        }
    }

    fn hint() -> FallbackHint {
        FallbackHint {
            lesson_title: "Cells".into(),
            section_titles: vec!["Intro".into(), "Wrap-up".into()],
            learning_objectives: vec![],
        }
    }

    #[test]
    fn strict_json_parses_first() {
        let (v, s) = parse_structured::<Titles>(r#"{"titles":["a"]}"#).unwrap();
        assert_eq!(v.titles, vec!["a"]);
        assert_eq!(s, ParseStrategy::Strict);
    }

    #[test]
    fn fenced_json_parses() {
        let raw = "Here you go:\n```json\n{\"titles\":[\"a\",\"b\"]}\n```\nEnjoy";
        let (v, s) = parse_structured::<Titles>(raw).unwrap();
        assert_eq!(v.titles.len(), 2);
        assert_eq!(s, ParseStrategy::CodeFence);
    }

    #[test]
    fn trailing_prose_is_cut_at_balanced_brace() {
        let raw = r#"{"titles":["a {curly} }"]} and some notes }"#;
        let (v, s) = parse_structured::<Titles>(raw).unwrap();
        assert_eq!(v.titles, vec!["a {curly} }"]);
        assert_eq!(s, ParseStrategy::BalancedExtract);
    }

    #[test]
    fn truncated_output_is_closed() {
        let raw = r#"{"titles":["alpha","be"#;
        let (v, s) = parse_structured::<Titles>(raw).unwrap();
        assert_eq!(v.titles, vec!["alpha", "be"]);
        assert_eq!(s, ParseStrategy::ClosedTruncation);

        let raw = r#"{"titles":["alpha"], "extra":"#;
        let (v, _) = parse_structured::<Titles>(raw).unwrap();
        assert_eq!(v.titles, vec!["alpha"]);
    }

    #[test]
    fn unusable_value_counts_as_failure() {
        assert!(parse_structured::<Titles>(r#"{"titles":[]}"#).is_none());
    }

    #[test]
    fn garbage_falls_back_with_hint_titles() {
        for raw in ["", "I cannot help with that.", "{{{", "]["] {
            let g = parse_or_fallback::<Titles>(raw, &hint());
            assert_eq!(g.outcome, Outcome::Fallback);
            assert_eq!(g.provenance(), Provenance::Fallback);
            assert_eq!(g.value.titles, vec!["Intro", "Wrap-up"]);
        }
    }

    struct Canned(&'static str);

    #[async_trait]
    impl ModelProvider for Canned {
        async fn complete(
            &self,
            _system: &str,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<String, ProviderError> {
            Ok(self.0.to_string())
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Unavailable("no embeddings".into()))
        }
    }

    #[tokio::test]
    async fn strict_generation_reports_unparseable() {
        let engine = ContentEngine::new(Arc::new(Canned("not json")));
        let err = engine
            .generate_strict::<Titles>("sys", "prompt", &CompletionOptions::json(100, 0.2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unparseable { shape: "titles", .. }));
    }

    #[tokio::test]
    async fn structured_generation_never_fails_on_bad_output() {
        let engine = ContentEngine::new(Arc::new(Canned("```\nnope\n```")));
        let g = engine
            .generate_structured::<Titles>(
                "sys",
                "prompt",
                &hint(),
                &CompletionOptions::json(100, 0.2),
            )
            .await
            .unwrap();
        assert_eq!(g.outcome, Outcome::Fallback);
    }
}
