//! The knowledge-base agent.
//!
//! Retrieval itself (vector stores, embeddings, document loading) is an
//! external collaborator behind the [`Retriever`] trait; the agent's job in
//! the core is the control-flow contract: score the latest user message,
//! and report the matches to the ensemble through an `AgentComplete`
//! payload.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::agents::{Agent, AgentKind, AgentOutput, RunContext};
use crate::config::FaqEntry;
use crate::error::Result;
use crate::event::Event;
use crate::tracker::Tracker;

/// One retrieval hit.
#[derive(Debug, Clone)]
pub struct ScoredDoc {
    /// The indexed content.
    pub content: String,
    /// A ready-to-send answer, when the source carries one (FAQ entries).
    pub answer: Option<String>,
    /// Similarity score, higher is closer.
    pub score: f64,
}

/// Similarity search over a knowledge base.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// The closest documents to `query`, best first.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDoc>>;
}

/// A term-overlap retriever over FAQ entries.
///
/// Good enough for small FAQ bots and deterministic tests; swap in a vector
/// store behind [`Retriever`] for anything larger.
#[derive(Debug, Default)]
pub struct FaqRetriever {
    entries: Vec<FaqEntry>,
}

impl FaqRetriever {
    /// Index the given FAQ entries.
    #[must_use]
    pub fn new(entries: Vec<FaqEntry>) -> Self {
        Self { entries }
    }

    fn score(query: &HashSet<String>, text: &str) -> f64 {
        let terms = tokenize(text);
        if terms.is_empty() || query.is_empty() {
            return 0.0;
        }
        let overlap = terms.intersection(query).count() as f64;
        overlap / query.len() as f64
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl Retriever for FaqRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDoc>> {
        let query_terms = tokenize(query);
        let mut scored: Vec<ScoredDoc> = self
            .entries
            .iter()
            .map(|entry| {
                let content = format!("Question: {}\nAnswer: {}", entry.q, entry.a);
                let score = Self::score(&query_terms, &entry.q).max(
                    Self::score(&query_terms, &entry.a) * 0.5,
                );
                ScoredDoc {
                    content,
                    answer: Some(entry.a.clone()),
                    score,
                }
            })
            .filter(|doc| doc.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// A retrieval agent.
pub struct KbAgent {
    name: String,
    description: String,
    retriever: Arc<dyn Retriever>,
    top_k: usize,
    similarity_threshold: f64,
}

impl std::fmt::Debug for KbAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KbAgent")
            .field("name", &self.name)
            .field("top_k", &self.top_k)
            .field("similarity_threshold", &self.similarity_threshold)
            .finish_non_exhaustive()
    }
}

impl KbAgent {
    /// Create a knowledge-base agent over a retriever.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        retriever: Arc<dyn Retriever>,
        top_k: usize,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            retriever,
            top_k,
            similarity_threshold,
        }
    }
}

#[async_trait]
impl Agent for KbAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Kb
    }

    async fn run(&self, tracker: &mut Tracker, _ctx: &RunContext<'_>) -> Result<AgentOutput> {
        let query = tracker.latest_text().to_owned();
        let docs = self.retriever.search(&query, self.top_k).await?;
        let matches: Vec<Value> = docs
            .iter()
            .filter(|doc| doc.score >= self.similarity_threshold)
            .map(|doc| {
                json!({
                    "content": doc.content,
                    "similarity_score": doc.score,
                })
            })
            .collect();
        debug!(agent = %self.name, query = %query, matches = matches.len(), "similarity search");

        if matches.is_empty() {
            return Ok(AgentOutput::end(vec![Event::agent_complete(&self.name)]));
        }
        let answer = docs
            .iter()
            .find(|doc| doc.score >= self.similarity_threshold)
            .and_then(|doc| doc.answer.clone().or_else(|| Some(doc.content.clone())));
        let metadata = json!({
            "matches": matches,
            "query": query,
            "total_matches": matches.len(),
            "answer": answer,
        });
        Ok(AgentOutput::end(vec![Event::agent_complete_with(
            &self.name,
            metadata,
        )]))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn faq() -> Vec<FaqEntry> {
        vec![
            FaqEntry {
                q: "What are your opening hours?".to_owned(),
                a: "We are open 9am to 5pm.".to_owned(),
            },
            FaqEntry {
                q: "Where are you located?".to_owned(),
                a: "Main Street 1.".to_owned(),
            },
        ]
    }

    #[tokio::test]
    async fn retriever_ranks_the_matching_entry_first() {
        let retriever = FaqRetriever::new(faq());
        let docs = retriever.search("what are your opening hours", 3).await.unwrap();
        assert!(!docs.is_empty());
        assert!(docs[0].content.contains("opening hours"));
        assert_eq!(docs[0].answer.as_deref(), Some("We are open 9am to 5pm."));
    }

    #[tokio::test]
    async fn kb_agent_reports_matches_in_metadata() {
        let agent = KbAgent::new(
            "faq",
            "answers common questions",
            Arc::new(FaqRetriever::new(faq())),
            3,
            0.1,
        );
        let mut tracker = Tracker::new(
            "u1",
            "bot",
            std::collections::HashMap::new(),
            std::collections::HashMap::new(),
            std::collections::HashMap::new(),
        );
        tracker.update(Event::user_input("when do you open"));

        let agents = std::collections::HashMap::new();
        let model = crate::providers::MockModel::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        let Some(Event::AgentComplete { metadata: Some(meta), .. }) = out.events.first() else {
            panic!("expected a complete event with metadata");
        };
        assert_eq!(meta["answer"], "We are open 9am to 5pm.");
        assert!(meta["total_matches"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn no_match_reports_empty_completion() {
        let agent = KbAgent::new(
            "faq",
            "",
            Arc::new(FaqRetriever::new(faq())),
            3,
            0.5,
        );
        let mut tracker = Tracker::new(
            "u1",
            "bot",
            std::collections::HashMap::new(),
            std::collections::HashMap::new(),
            std::collections::HashMap::new(),
        );
        tracker.update(Event::user_input("zzz qqq"));

        let agents = std::collections::HashMap::new();
        let model = crate::providers::MockModel::new();
        let ctx = RunContext {
            agents: &agents,
            tools: None,
            model: &model,
        };
        let out = agent.run(&mut tracker, &ctx).await.unwrap();
        assert!(matches!(
            out.events.first(),
            Some(Event::AgentComplete { metadata: None, .. })
        ));
    }
}
