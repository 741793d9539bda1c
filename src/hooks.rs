//! Session lifecycle hooks.
//!
//! The hooks tie the analysis pipeline to the memory client: session start
//! pulls recent context forward, each user prompt is analyzed and may
//! trigger a retrieval, and session end writes a summary back. Retrieval
//! failures never surface to the conversation; the worst case is a prompt
//! with no injected context.

use crate::analyzer::{AnalysisResult, TieredAnalyzer};
use crate::client::{MemoryClient, MemoryRecord};
use crate::conversation::{ConversationTracker, Role};
use crate::error::Result;
use crate::trigger::{TriggerDecision, TriggerEngine};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Memories injected per trigger by default.
pub const DEFAULT_INJECT_LIMIT: usize = 5;

/// Time expression used to pull context at session start.
const SESSION_START_WINDOW: &str = "last week";

/// What a prompt hook produced: the verdict, the analysis behind it, and
/// the formatted context block when a retrieval happened.
#[derive(Debug)]
pub struct PromptOutcome {
    pub analysis: AnalysisResult,
    pub decision: TriggerDecision,
    /// Rendered context to inject, when the trigger fired and found memories
    pub context: Option<String>,
}

/// Drives the analyze/trigger/retrieve cycle across a session.
pub struct SessionHooks {
    analyzer: TieredAnalyzer,
    engine: TriggerEngine,
    tracker: ConversationTracker,
    client: Arc<MemoryClient>,
    session_id: Uuid,
    inject_limit: usize,
}

impl SessionHooks {
    pub fn new(
        analyzer: TieredAnalyzer,
        engine: TriggerEngine,
        tracker: ConversationTracker,
        client: Arc<MemoryClient>,
    ) -> Self {
        Self {
            analyzer,
            engine,
            tracker,
            client,
            session_id: Uuid::new_v4(),
            inject_limit: DEFAULT_INJECT_LIMIT,
        }
    }

    /// Cap the number of memories injected per trigger.
    pub fn with_inject_limit(mut self, limit: usize) -> Self {
        self.inject_limit = limit;
        self
    }

    /// Identity of this session, stamped on stored summaries.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Trigger bookkeeping for status surfaces.
    pub fn engine(&self) -> &TriggerEngine {
        &self.engine
    }

    /// Session start: pull recent memories forward and render them for
    /// injection. Empty history renders nothing.
    pub async fn on_session_start(&self) -> Result<Option<String>> {
        let memories = self
            .client
            .retrieve_by_time(SESSION_START_WINDOW, self.inject_limit)
            .await?;
        tracing::info!(session = %self.session_id, count = memories.len(), "session start");
        Ok(format_context(&memories))
    }

    /// User prompt: analyze, decide, and retrieve on a trigger.
    ///
    /// A recoverable retrieval failure gets one reconnect-and-retry; after
    /// that the prompt proceeds without context.
    pub async fn on_prompt(&mut self, text: &str) -> PromptOutcome {
        // Analyze against the window as it stood before this prompt, then
        // fold the prompt in.
        let analysis = self.analyzer.analyze(text, &self.tracker);
        self.tracker.observe_message(Role::User, text);

        let decision = self.engine.evaluate(&analysis);
        if !decision.should_trigger {
            return PromptOutcome {
                analysis,
                decision,
                context: None,
            };
        }

        self.analyzer.matcher().record_trigger(&analysis.matched_rules);

        let memories = match self.client.retrieve(text, self.inject_limit).await {
            Ok(memories) => memories,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "retrieval failed, reconnecting once");
                self.client.disconnect().await;
                match self.client.retrieve(text, self.inject_limit).await {
                    Ok(memories) => memories,
                    Err(e) => {
                        tracing::warn!(error = %e, "retry failed, continuing without context");
                        Vec::new()
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, continuing without context");
                Vec::new()
            }
        };

        PromptOutcome {
            analysis,
            decision,
            context: format_context(&memories),
        }
    }

    /// Assistant reply: fold it into the conversation window.
    pub fn on_assistant_reply(&mut self, text: &str) {
        self.tracker.observe_message(Role::Assistant, text);
    }

    /// Session end: store a summary record. Returns the service-computed
    /// content hash.
    pub async fn on_session_end(&self, summary: &str) -> Result<String> {
        let state = self.engine.state();
        tracing::info!(
            session = %self.session_id,
            analyses = state.total_analyses,
            triggers = state.total_triggers,
            "session end"
        );

        let record = MemoryRecord::new(
            summary,
            vec!["session".to_string(), format!("session:{}", self.session_id)],
        )
        .with_type("session-summary");
        self.client.store(&record).await
    }
}

/// Render memories as a markdown block for injection. `None` when there is
/// nothing to show.
pub fn format_context(memories: &[MemoryRecord]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }

    let mut block = String::from("## Recalled Context\n\n");
    for memory in memories {
        let kind = memory.memory_type.as_deref().unwrap_or("note");
        block.push_str(&format!("- [{}] {}", kind, memory.content.trim()));
        if let Some(score) = memory.similarity_score {
            block.push_str(&format!(" (relevance {:.2})", score));
        }
        if let Some(created) = memory.created_at {
            let age_days = (Utc::now() - created).num_days();
            if age_days > 0 {
                block.push_str(&format!(" ({}d ago)", age_days));
            }
        }
        block.push('\n');
    }
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::PerformanceProfile;
    use crate::client::{ConnectionNegotiator, InMemoryService, TransportEndpoint};
    use crate::patterns::{default_rules, PatternMatcher};
    use crate::trigger::{DEFAULT_COOLDOWN_MS, DEFAULT_TRIGGER_THRESHOLD};
    use pretty_assertions::assert_eq;

    fn hooks_over(service: Arc<InMemoryService>) -> SessionHooks {
        let matcher = PatternMatcher::new(default_rules());
        let analyzer = TieredAnalyzer::new(matcher, PerformanceProfile::balanced());
        let engine = TriggerEngine::new(DEFAULT_TRIGGER_THRESHOLD, DEFAULT_COOLDOWN_MS);
        let tracker = ConversationTracker::default();
        let client = Arc::new(MemoryClient::new(Arc::new(ConnectionNegotiator::new(
            vec![TransportEndpoint::InMemory(service)],
        ))));
        SessionHooks::new(analyzer, engine, tracker, client)
    }

    #[tokio::test]
    async fn test_prompt_triggers_and_injects_context() {
        let service = InMemoryService::new();
        service
            .seed(
                MemoryRecord::new(
                    "we decided the authentication system uses JWT",
                    vec!["decision".into()],
                )
                .with_type("decision"),
            )
            .await;

        let mut hooks = hooks_over(service);
        let outcome = hooks
            .on_prompt("What did we decide about the authentication system?")
            .await;

        assert!(outcome.decision.should_trigger);
        let context = outcome.context.expect("context block");
        assert!(context.starts_with("## Recalled Context"));
        assert!(context.contains("[decision]"));
        assert!(context.contains("JWT"));
    }

    #[tokio::test]
    async fn test_smalltalk_does_not_trigger_or_connect() {
        let service = InMemoryService::new();
        let mut hooks = hooks_over(service.clone());

        let outcome = hooks.on_prompt("Hello!").await;

        assert!(!outcome.decision.should_trigger);
        assert!(outcome.context.is_none());
        assert_eq!(outcome.analysis.confidence, 0.0);
        // No retrieval means no connection was ever made.
        assert_eq!(service.handshake_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_with_no_matching_memories_yields_no_context() {
        let service = InMemoryService::new();
        let mut hooks = hooks_over(service);

        let outcome = hooks
            .on_prompt("What did we decide about the deployment cadence?")
            .await;

        assert!(outcome.decision.should_trigger);
        assert!(outcome.context.is_none());
    }

    #[tokio::test]
    async fn test_session_start_renders_recent_memories() {
        let service = InMemoryService::new();
        service
            .seed(MemoryRecord::new("migrated CI to self-hosted runners", vec![]))
            .await;

        let hooks = hooks_over(service);
        let block = hooks.on_session_start().await.unwrap().expect("context");
        assert!(block.contains("self-hosted runners"));
    }

    #[tokio::test]
    async fn test_session_start_with_empty_history() {
        let service = InMemoryService::new();
        let hooks = hooks_over(service);
        assert!(hooks.on_session_start().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_end_stores_summary() {
        let service = InMemoryService::new();
        let hooks = hooks_over(service.clone());

        let hash = hooks
            .on_session_end("refactored the ingestion pipeline")
            .await
            .unwrap();
        assert!(!hash.is_empty());
        assert_eq!(service.record_count().await, 1);
    }

    #[test]
    fn test_format_context_empty() {
        assert!(format_context(&[]).is_none());
    }

    #[test]
    fn test_format_context_includes_relevance() {
        let mut record = MemoryRecord::new("picked tokio over async-std", vec![]);
        record.similarity_score = Some(0.87);
        let block = format_context(&[record]).unwrap();
        assert!(block.contains("(relevance 0.87)"));
    }
}
