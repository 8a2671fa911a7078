//! In-memory conversation threads with fuzzy description lookup.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use memoir_core::{
    ConversationThreads, RelatedTermIndexSettings, ScoredThreadOrdinal, Thread,
};
use memoir_embed::{EmbeddingModel, VectorBase};

struct ThreadState {
    threads: Vec<Thread>,
    base: VectorBase,
}

pub struct MemoryConversationThreads {
    state: RwLock<ThreadState>,
    settings: RelatedTermIndexSettings,
}

impl MemoryConversationThreads {
    pub fn new(model: Arc<dyn EmbeddingModel>, settings: RelatedTermIndexSettings) -> Self {
        Self {
            state: RwLock::new(ThreadState {
                threads: Vec::new(),
                base: VectorBase::new(model),
            }),
            settings,
        }
    }
}

#[async_trait]
impl ConversationThreads for MemoryConversationThreads {
    async fn size(&self) -> Result<usize> {
        Ok(self.state.read().await.threads.len())
    }

    async fn threads(&self) -> Result<Vec<Thread>> {
        Ok(self.state.read().await.threads.clone())
    }

    async fn add_thread(&self, thread: Thread) -> Result<()> {
        let mut state = self.state.write().await;
        state.base.add_key(&thread.description).await?;
        state.threads.push(thread);
        Ok(())
    }

    async fn lookup_thread(
        &self,
        description: &str,
        max_matches: Option<usize>,
        threshold_score: Option<f32>,
    ) -> Result<Vec<ScoredThreadOrdinal>> {
        let state = self.state.read().await;
        let hits = state
            .base
            .fuzzy_lookup(
                description,
                Some(max_matches.unwrap_or(self.settings.max_hits)),
                Some(threshold_score.unwrap_or(self.settings.min_score)),
            )
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| ScoredThreadOrdinal {
                thread_ordinal: hit.ordinal,
                score: hit.score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::{TextRange, TextLocation};
    use memoir_embed::MockEmbeddingModel;

    #[tokio::test]
    async fn threads_are_found_by_description() {
        let threads = MemoryConversationThreads::new(
            Arc::new(MockEmbeddingModel::new(32)),
            RelatedTermIndexSettings {
                max_hits: 5,
                min_score: 0.0,
            },
        );
        threads
            .add_thread(Thread {
                description: "introductions and greetings".into(),
                ranges: vec![TextRange::point(TextLocation::new(0, 0))],
            })
            .await
            .unwrap();
        threads
            .add_thread(Thread {
                description: "closing remarks".into(),
                ranges: vec![TextRange::point(TextLocation::new(9, 0))],
            })
            .await
            .unwrap();
        let hits = threads
            .lookup_thread("greetings", Some(1), None)
            .await
            .unwrap();
        assert_eq!(hits[0].thread_ordinal, 0);
    }
}
