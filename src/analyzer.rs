//! Knowledge-base profiling and mode-aware retrieval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{ContentEngine, FallbackHint, StructuredOutput};
use crate::guidance::PromptBuilder;
use crate::models::{
    ContentDepth, ContentQuality, GenerationMode, KbDocument, KnowledgeBaseAnalysis,
    RetrievedChunk,
};
use crate::provider::CompletionOptions;
use crate::storage::{Storage, StorageResult};

pub const ANALYSIS_SYSTEM_PROMPT: &str = "You are an instructional designer profiling a \
    knowledge base of course documents. Respond with a single JSON object only.";

const ANALYSIS_SAMPLE_CHUNKS: usize = 10;
const EXCERPT_CHARS: usize = 600;

pub fn classify_depth(total_documents: usize, average_chunks: f64) -> ContentDepth {
    if total_documents >= 5 && average_chunks >= 15.0 {
        ContentDepth::Comprehensive
    } else if total_documents >= 2 && average_chunks >= 8.0 {
        ContentDepth::Moderate
    } else {
        ContentDepth::Minimal
    }
}

pub fn recommend_mode(
    depth: ContentDepth,
    quality: ContentQuality,
    total_documents: usize,
) -> GenerationMode {
    match (depth, quality) {
        (ContentDepth::Comprehensive, ContentQuality::High) if total_documents >= 5 => {
            GenerationMode::KbOnly
        }
        (ContentDepth::Moderate, q) if q != ContentQuality::Low => GenerationMode::KbPriority,
        _ => GenerationMode::KbSupplemented,
    }
}

/// Qualitative half of the analysis, as returned by the model.
#[derive(Debug, Clone, Deserialize, Default)]
struct KbProfile {
    #[serde(
        default,
        alias = "subjectCoverage",
        alias = "subjects",
        deserialize_with = "crate::payloads::string_list"
    )]
    subject_coverage: Vec<String>,
    #[serde(default, alias = "contentQuality", alias = "quality")]
    content_quality: String,
    #[serde(
        default,
        alias = "conceptCoverage",
        alias = "concepts",
        deserialize_with = "crate::payloads::string_list"
    )]
    concept_coverage: Vec<String>,
    #[serde(
        default,
        alias = "knowledgeGaps",
        alias = "gaps",
        deserialize_with = "crate::payloads::string_list"
    )]
    knowledge_gaps: Vec<String>,
    #[serde(
        default,
        alias = "recommendedObjectives",
        alias = "learningObjectives",
        alias = "learning_objectives",
        deserialize_with = "crate::payloads::string_list"
    )]
    recommended_objectives: Vec<String>,
}

impl KbProfile {
    fn quality(&self) -> ContentQuality {
        ContentQuality::from_lenient(&self.content_quality).unwrap_or(ContentQuality::Medium)
    }
}

impl StructuredOutput for KbProfile {
    const SHAPE: &'static str = "kb_profile";

    fn fallback(_hint: &FallbackHint) -> Self {
        KbProfile {
            subject_coverage: vec!["General course material".to_string()],
            content_quality: ContentQuality::Medium.as_str().to_string(),
            concept_coverage: Vec::new(),
            knowledge_gaps: Vec::new(),
            recommended_objectives: vec![
                "Understand the core concepts presented in the course materials".to_string(),
            ],
        }
    }

    fn is_usable(&self) -> bool {
        !self.subject_coverage.is_empty()
    }
}

/// Result cap selector for retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Content sample embedded in the outline prompt.
    Outline,
    /// Course-wide content fetched once per job into the content cache.
    Course,
    /// Material for one lesson.
    Lesson,
}

impl SearchScope {
    pub fn max_results(&self, mode: GenerationMode) -> usize {
        let broad = mode == GenerationMode::KbOnly;
        match (self, broad) {
            (SearchScope::Outline, _) => 10,
            (SearchScope::Course, true) => 60,
            (SearchScope::Course, false) => 30,
            (SearchScope::Lesson, true) => 12,
            (SearchScope::Lesson, false) => 8,
        }
    }
}

/// Similarity thresholds and per-query caps, tried in order.
pub fn search_tiers(mode: GenerationMode) -> &'static [(f64, usize)] {
    match mode {
        GenerationMode::KbOnly => &[(0.7, 10), (0.5, 20), (0.3, 30), (0.0, 50)],
        GenerationMode::KbPriority => &[(0.7, 10), (0.5, 20)],
        GenerationMode::KbSupplemented => &[(0.75, 10)],
    }
}

pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}…")
    }
}

#[derive(Clone)]
pub struct KnowledgeBaseAnalyzer {
    storage: Arc<dyn Storage>,
    engine: ContentEngine,
}

impl KnowledgeBaseAnalyzer {
    pub fn new(storage: Arc<dyn Storage>, engine: ContentEngine) -> Self {
        KnowledgeBaseAnalyzer { storage, engine }
    }

    /// Counts are authoritative; the qualitative profile comes from one model
    /// call and degrades to a default profile rather than failing.
    pub async fn analyze_knowledge_base(
        &self,
        knowledge_base_id: Uuid,
    ) -> StorageResult<KnowledgeBaseAnalysis> {
        let documents = self.storage.list_documents(knowledge_base_id).await?;
        let mut total_chunks = 0usize;
        for doc in &documents {
            total_chunks += self.storage.count_chunks(doc.id).await?;
        }
        let total_documents = documents.len();
        let average = if total_documents == 0 {
            0.0
        } else {
            total_chunks as f64 / total_documents as f64
        };
        let depth = classify_depth(total_documents, average);

        let sample = self
            .storage
            .list_chunks(knowledge_base_id, ANALYSIS_SAMPLE_CHUNKS)
            .await?;
        let excerpts: Vec<String> = sample
            .iter()
            .map(|c| excerpt(&c.content, EXCERPT_CHARS))
            .collect();
        let prompt = analysis_prompt(&documents, total_chunks, depth, &excerpts);

        let profile = match self
            .engine
            .generate_structured::<KbProfile>(
                ANALYSIS_SYSTEM_PROMPT,
                &prompt,
                &FallbackHint::default(),
                &CompletionOptions::json(1500, 0.3),
            )
            .await
        {
            Ok(generated) => generated.value,
            Err(e) => {
                tracing::warn!(
                    kb = %knowledge_base_id,
                    error = %e,
                    "knowledge base profiling failed; using default profile"
                );
                KbProfile::fallback(&FallbackHint::default())
            }
        };

        let quality = profile.quality();
        let analysis = KnowledgeBaseAnalysis {
            total_documents,
            total_chunks,
            average_chunks_per_document: average,
            content_depth: depth,
            subject_coverage: profile.subject_coverage,
            content_quality: quality,
            concept_coverage: profile.concept_coverage,
            knowledge_gaps: profile.knowledge_gaps,
            recommended_objectives: profile.recommended_objectives,
            recommended_generation_mode: recommend_mode(depth, quality, total_documents),
        };
        tracing::info!(
            kb = %knowledge_base_id,
            documents = total_documents,
            chunks = total_chunks,
            depth = %analysis.content_depth,
            quality = %analysis.content_quality,
            mode = %analysis.recommended_generation_mode,
            "knowledge base analyzed"
        );
        Ok(analysis)
    }

    /// Mode-aware retrieval. Never returns an empty list while the knowledge
    /// base has chunks: embedding failures and empty matches fall back to a
    /// plain sample.
    pub async fn search_knowledge_base_for_generation(
        &self,
        knowledge_base_id: Uuid,
        query: &str,
        mode: GenerationMode,
        scope: SearchScope,
    ) -> StorageResult<Vec<RetrievedChunk>> {
        let cap = scope.max_results(mode);
        let embedding = match self.engine.provider().embed(query).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(
                    kb = %knowledge_base_id,
                    error = %e,
                    "query embedding failed; sampling chunks"
                );
                return self.sample(knowledge_base_id, cap).await;
            }
        };

        let mut best: HashMap<Uuid, RetrievedChunk> = HashMap::new();
        for (threshold, limit) in search_tiers(mode) {
            let hits = match self
                .storage
                .match_chunks(knowledge_base_id, &embedding, *threshold, (*limit).max(cap))
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(
                        kb = %knowledge_base_id,
                        threshold,
                        error = %e,
                        "similarity tier failed"
                    );
                    continue;
                }
            };
            for hit in hits {
                match best.get(&hit.id) {
                    Some(existing) if existing.similarity >= hit.similarity => {}
                    _ => {
                        best.insert(hit.id, hit);
                    }
                }
            }
        }

        if best.is_empty() {
            tracing::debug!(
                kb = %knowledge_base_id,
                %mode,
                "no similarity matches; sampling chunks"
            );
            return self.sample(knowledge_base_id, cap).await;
        }

        let mut ranked: Vec<RetrievedChunk> = best.into_values().collect();
        sort_by_similarity(&mut ranked);

        if mode == GenerationMode::KbOnly {
            let documents = self.storage.list_documents(knowledge_base_id).await?;
            let covered: HashSet<Uuid> = ranked.iter().map(|c| c.document_id).collect();
            let missing: Vec<Uuid> = documents
                .iter()
                .map(|d| d.id)
                .filter(|id| !covered.contains(id))
                .collect();
            if !missing.is_empty() {
                // one representative per document outranked in every tier
                let top_up = self.storage.first_chunks(&missing).await?;
                ranked.extend(top_up.into_iter().map(RetrievedChunk::from));
            }
            ranked = rebalance_by_document(ranked);
        }

        ranked.truncate(cap);
        Ok(ranked)
    }

    async fn sample(
        &self,
        knowledge_base_id: Uuid,
        cap: usize,
    ) -> StorageResult<Vec<RetrievedChunk>> {
        Ok(self
            .storage
            .list_chunks(knowledge_base_id, cap)
            .await?
            .into_iter()
            .map(RetrievedChunk::from)
            .collect())
    }
}

fn sort_by_similarity(chunks: &mut [RetrievedChunk]) {
    chunks.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Interleaves documents round-robin, each document's chunks staying in rank
/// order, so the first K results touch K distinct documents.
pub fn rebalance_by_document(ranked: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut groups: HashMap<Uuid, std::collections::VecDeque<RetrievedChunk>> = HashMap::new();
    for chunk in ranked {
        if !groups.contains_key(&chunk.document_id) {
            order.push(chunk.document_id);
        }
        groups.entry(chunk.document_id).or_default().push_back(chunk);
    }
    let mut out = Vec::new();
    loop {
        let mut progressed = false;
        for doc in &order {
            if let Some(chunk) = groups.get_mut(doc).and_then(|g| g.pop_front()) {
                out.push(chunk);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    out
}

fn analysis_prompt(
    documents: &[KbDocument],
    total_chunks: usize,
    depth: ContentDepth,
    excerpts: &[String],
) -> String {
    let docs: Vec<String> = documents
        .iter()
        .map(|d| match &d.summary {
            Some(s) if !s.trim().is_empty() => format!("{}: {}", d.file_name, excerpt(s, 300)),
            _ => d.file_name.clone(),
        })
        .collect();
    PromptBuilder::new()
        .block(
            "KNOWLEDGE BASE",
            format!(
                "{} documents, {} content chunks, depth classified as {}.",
                documents.len(),
                total_chunks,
                depth
            ),
        )
        .list("DOCUMENTS", &docs)
        .list("CONTENT EXCERPTS", excerpts)
        .block(
            "TASK",
            "Profile this material for course design. Identify the subjects it covers, rate \
             its overall quality for teaching (low, medium or high), list the key concepts it \
             explains, the gaps a course would need to fill, and learning objectives it can \
             support.",
        )
        .block(
            "RESPONSE FORMAT",
            r#"{"subject_coverage": [string], "content_quality": "low|medium|high", "concept_coverage": [string], "knowledge_gaps": [string], "recommended_objectives": [string]}"#,
        )
        .build()
}
