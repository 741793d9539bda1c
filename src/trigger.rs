//! Trigger decision state machine: threshold, cooldown, and session
//! counters applied to a fused analysis confidence.
//!
//! The engine is pure with respect to its session state: no network calls
//! happen here. It produces a verdict that the caller uses to optionally
//! invoke the memory client.

use crate::analyzer::AnalysisResult;
use crate::events::{ClientEvent, ClientEventType, EventSender};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Phases of the decision state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    /// Waiting for a message
    Idle,
    /// Applying threshold and cooldown rules
    Evaluating,
    /// Last verdict was a trigger
    Triggered,
    /// Last verdict was a skip
    Skipped,
}

/// Verdict for one analyzed message. Consumed once by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDecision {
    /// Whether to retrieve and inject stored context
    pub should_trigger: bool,
    /// Fused confidence that led to the verdict, in [0, 1]
    pub confidence: f64,
    /// Which rules/boosts fired, or why the message was skipped
    pub reasoning: String,
    /// When the verdict was produced
    pub timestamp: DateTime<Utc>,
}

/// Per-session trigger bookkeeping. Mutated only by the engine; destroyed
/// with the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTriggerState {
    /// When the last trigger fired
    pub last_trigger_at: Option<DateTime<Utc>>,
    /// Minimum time between triggers
    pub cooldown_ms: i64,
    /// Messages analyzed this session
    pub total_analyses: u64,
    /// Triggers fired this session
    pub total_triggers: u64,
    /// Running average analysis latency in milliseconds
    pub avg_latency_ms: f64,
}

impl SessionTriggerState {
    /// Create session state with the given cooldown window.
    pub fn new(cooldown_ms: i64) -> Self {
        Self {
            last_trigger_at: None,
            cooldown_ms,
            total_analyses: 0,
            total_triggers: 0,
            avg_latency_ms: 0.0,
        }
    }

    /// Remaining cooldown at `now`, if a cooldown is active.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_trigger_at?;
        let window = Duration::milliseconds(self.cooldown_ms);
        let elapsed = now - last;
        if elapsed < window {
            Some(window - elapsed)
        } else {
            None
        }
    }

    fn record_latency(&mut self, latency_ms: f64) {
        let n = self.total_analyses as f64;
        self.avg_latency_ms = self.avg_latency_ms * (n - 1.0) / n + latency_ms / n;
    }
}

/// Applies threshold + cooldown rules to fused confidences.
pub struct TriggerEngine {
    /// Minimum fused confidence to trigger
    threshold: f64,
    /// Session bookkeeping
    state: SessionTriggerState,
    /// Current phase, for status reporting
    phase: TriggerPhase,
    /// Optional event channel for collaborators
    events: Option<EventSender>,
}

/// Default trigger threshold.
pub const DEFAULT_TRIGGER_THRESHOLD: f64 = 0.6;
/// Default cooldown window in milliseconds.
pub const DEFAULT_COOLDOWN_MS: i64 = 30_000;

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TRIGGER_THRESHOLD, DEFAULT_COOLDOWN_MS)
    }
}

impl TriggerEngine {
    /// Create an engine with the given threshold and cooldown window.
    pub fn new(threshold: f64, cooldown_ms: i64) -> Self {
        Self {
            threshold,
            state: SessionTriggerState::new(cooldown_ms),
            phase: TriggerPhase::Idle,
            events: None,
        }
    }

    /// Attach an event sender for trigger verdicts and latency samples.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// The session state, for status reporting.
    pub fn state(&self) -> &SessionTriggerState {
        &self.state
    }

    /// The current phase.
    pub fn phase(&self) -> TriggerPhase {
        self.phase
    }

    /// Evaluate an analysis result into a verdict.
    pub fn evaluate(&mut self, analysis: &AnalysisResult) -> TriggerDecision {
        self.evaluate_at(analysis, Utc::now())
    }

    /// Evaluate with an explicit clock. Exposed for deterministic tests of
    /// the cooldown invariant.
    pub fn evaluate_at(&mut self, analysis: &AnalysisResult, now: DateTime<Utc>) -> TriggerDecision {
        self.phase = TriggerPhase::Evaluating;
        self.state.total_analyses += 1;
        self.state.record_latency(analysis.elapsed_ms);

        if let Some(events) = &self.events {
            events.emit(
                ClientEvent::new(ClientEventType::AnalyzerLatency, "analysis complete")
                    .with_metadata("elapsed_ms", analysis.elapsed_ms)
                    .with_metadata("tier", format!("{:?}", analysis.tier)),
            );
        }

        let decision = if analysis.confidence < self.threshold {
            self.phase = TriggerPhase::Skipped;
            TriggerDecision {
                should_trigger: false,
                confidence: analysis.confidence,
                reasoning: format!(
                    "confidence {:.2} below threshold {:.2}",
                    analysis.confidence, self.threshold
                ),
                timestamp: now,
            }
        } else if let Some(remaining) = self.state.cooldown_remaining(now) {
            // Distinguish cooldown skips from low-confidence skips and name
            // the remaining seconds, so callers and tests can tell them apart.
            self.phase = TriggerPhase::Skipped;
            TriggerDecision {
                should_trigger: false,
                confidence: analysis.confidence,
                reasoning: format!(
                    "cooldown active: {}s remaining (confidence {:.2} met threshold {:.2})",
                    remaining.num_seconds(),
                    analysis.confidence,
                    self.threshold
                ),
                timestamp: now,
            }
        } else {
            self.phase = TriggerPhase::Triggered;
            self.state.last_trigger_at = Some(now);
            self.state.total_triggers += 1;

            let rules: Vec<&str> = analysis.matched_rules.iter().map(|m| m.name).collect();
            let mut reasoning = format!(
                "confidence {:.2} met threshold {:.2}",
                analysis.confidence, self.threshold
            );
            if !rules.is_empty() {
                reasoning.push_str(&format!("; rules: {}", rules.join("+")));
            }
            if !analysis.boosts.is_empty() {
                reasoning.push_str(&format!("; boosts: {}", analysis.boosts.join("+")));
            }

            TriggerDecision {
                should_trigger: true,
                confidence: analysis.confidence,
                reasoning,
                timestamp: now,
            }
        };

        if let Some(events) = &self.events {
            events.emit(
                ClientEvent::new(ClientEventType::TriggerVerdict, decision.reasoning.clone())
                    .with_metadata("should_trigger", decision.should_trigger)
                    .with_metadata("confidence", decision.confidence),
            );
        }

        tracing::debug!(
            should_trigger = decision.should_trigger,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "trigger verdict"
        );

        self.phase = TriggerPhase::Idle;
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::TieredAnalyzer;
    use crate::conversation::ConversationTracker;

    fn analyze(text: &str) -> AnalysisResult {
        TieredAnalyzer::default().analyze(text, &ConversationTracker::default())
    }

    #[test]
    fn test_no_signal_never_triggers() {
        let mut engine = TriggerEngine::default();
        let decision = engine.evaluate(&analyze("Hello!"));

        assert!(!decision.should_trigger);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.reasoning.contains("below threshold"));
    }

    #[test]
    fn test_explicit_recall_triggers() {
        let mut engine = TriggerEngine::default();
        let decision =
            engine.evaluate(&analyze("What did we decide about the authentication system?"));

        assert!(decision.should_trigger);
        assert!(decision.confidence >= 0.6);
        assert!(decision.reasoning.contains("rules:"));
        assert_eq!(engine.state().total_triggers, 1);
    }

    #[test]
    fn test_cooldown_skip_names_remaining_seconds() {
        let mut engine = TriggerEngine::default();
        let analysis = analyze("What did we decide about the authentication system?");

        let t0 = Utc::now();
        let first = engine.evaluate_at(&analysis, t0);
        assert!(first.should_trigger);

        // Same message 10s later, cooldown is 30s: skipped with ~20s left.
        let second = engine.evaluate_at(&analysis, t0 + Duration::seconds(10));
        assert!(!second.should_trigger);
        assert!(second.reasoning.contains("cooldown active"));
        assert!(second.reasoning.contains("20s remaining"));
    }

    #[test]
    fn test_trigger_allowed_after_cooldown() {
        let mut engine = TriggerEngine::default();
        let analysis = analyze("What did we decide about the authentication system?");

        let t0 = Utc::now();
        assert!(engine.evaluate_at(&analysis, t0).should_trigger);
        assert!(engine
            .evaluate_at(&analysis, t0 + Duration::seconds(31))
            .should_trigger);
        assert_eq!(engine.state().total_triggers, 2);
    }

    #[test]
    fn test_cooldown_applies_regardless_of_confidence() {
        let mut engine = TriggerEngine::new(0.1, 30_000);
        let analysis = analyze("remind me what did we decide last session?");
        assert!(analysis.confidence > 0.9);

        let t0 = Utc::now();
        engine.evaluate_at(&analysis, t0);
        let blocked = engine.evaluate_at(&analysis, t0 + Duration::seconds(1));
        assert!(!blocked.should_trigger);
        assert!(blocked.reasoning.contains("cooldown"));
    }

    #[test]
    fn test_session_counters_and_latency_average() {
        let mut engine = TriggerEngine::default();
        engine.evaluate(&analyze("Hello!"));
        engine.evaluate(&analyze("what did we decide about auth?"));

        let state = engine.state();
        assert_eq!(state.total_analyses, 2);
        assert_eq!(state.total_triggers, 1);
        assert!(state.avg_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_verdict_event_emitted() {
        let (sender, mut rx) = EventSender::channel(8);
        let mut engine = TriggerEngine::default().with_events(sender);
        engine.evaluate(&analyze("what did we decide about auth?"));

        let mut saw_verdict = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == ClientEventType::TriggerVerdict {
                saw_verdict = true;
                assert_eq!(event.metadata["should_trigger"], true);
            }
        }
        assert!(saw_verdict);
    }
}
