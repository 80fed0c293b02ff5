use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::models::{GenerationMode, RetrievedChunk};

/// Course-wide knowledge-base content for one job, keyed by
/// (knowledge base, mode). Owned by the job and cleared when it ends.
#[derive(Debug, Default)]
pub struct KbContentCache {
    entries: HashMap<(Uuid, GenerationMode), Arc<Vec<RetrievedChunk>>>,
}

impl KbContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        knowledge_base_id: Uuid,
        mode: GenerationMode,
    ) -> Option<Arc<Vec<RetrievedChunk>>> {
        self.entries.get(&(knowledge_base_id, mode)).cloned()
    }

    /// Runs `fetch` only on a miss. A failed fetch leaves the cache untouched.
    pub async fn get_or_fetch<F, Fut, E>(
        &mut self,
        knowledge_base_id: Uuid,
        mode: GenerationMode,
        fetch: F,
    ) -> Result<Arc<Vec<RetrievedChunk>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<RetrievedChunk>, E>>,
    {
        if let Some(hit) = self.get(knowledge_base_id, mode) {
            return Ok(hit);
        }
        let chunks = Arc::new(fetch().await?);
        tracing::debug!(
            kb = %knowledge_base_id,
            %mode,
            chunks = chunks.len(),
            "cached course content"
        );
        self.entries.insert((knowledge_base_id, mode), chunks.clone());
        Ok(chunks)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
