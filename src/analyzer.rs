//! Tiered message analysis under an escalating latency budget.
//!
//! The analyzer orchestrates the pattern matcher and conversation tracker
//! across three tiers:
//!
//! - **Tier 0** (instant): pattern matching only
//! - **Tier 1** (fast): tier 0 plus topic extraction
//! - **Tier 2** (intensive): tier 1 plus semantic-shift computation
//!
//! It stops early when the configured ceiling would be exceeded, reports
//! the highest tier actually completed, and never raises to the caller: a
//! tier that faults contributes zero confidence.

use crate::conversation::{extract_topics, ConversationTracker};
use crate::patterns::{PatternMatcher, RuleCategory, RuleMatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

/// A bounded-latency stage of analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisTier {
    /// Pattern matching only
    Tier0,
    /// Plus topic extraction
    Tier1,
    /// Plus semantic shift
    Tier2,
}

impl std::fmt::Display for AnalysisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tier0 => write!(f, "tier0"),
            Self::Tier1 => write!(f, "tier1"),
            Self::Tier2 => write!(f, "tier2"),
        }
    }
}

/// Performance profile: which tiers run and under what latency budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceProfile {
    /// Tier 0 enabled (pattern matching)
    pub tier0_enabled: bool,
    /// Tier 1 enabled (topic extraction)
    pub tier1_enabled: bool,
    /// Tier 2 enabled (semantic shift)
    pub tier2_enabled: bool,
    /// Per-tier budgets in milliseconds
    pub tier0_budget_ms: u64,
    /// Tier 1 budget in milliseconds
    pub tier1_budget_ms: u64,
    /// Tier 2 budget in milliseconds
    pub tier2_budget_ms: u64,
    /// Overall latency ceiling in milliseconds
    pub latency_ceiling_ms: u64,
    /// Semantic shift at or above this value earns the shift boost
    pub shift_threshold: f64,
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self::balanced()
    }
}

impl PerformanceProfile {
    /// Default profile: all tiers, standard budgets.
    pub fn balanced() -> Self {
        Self {
            tier0_enabled: true,
            tier1_enabled: true,
            tier2_enabled: true,
            tier0_budget_ms: 50,
            tier1_budget_ms: 150,
            tier2_budget_ms: 500,
            latency_ceiling_ms: 500,
            shift_threshold: 0.5,
        }
    }

    /// Latency-first profile: pattern matching only.
    pub fn speed_focused() -> Self {
        Self {
            tier1_enabled: false,
            tier2_enabled: false,
            latency_ceiling_ms: 100,
            ..Self::balanced()
        }
    }

    /// Recall-first profile: all tiers with a generous ceiling.
    pub fn memory_aware() -> Self {
        Self {
            latency_ceiling_ms: 1_000,
            ..Self::balanced()
        }
    }

    /// The highest enabled tier, if any.
    pub fn max_tier(&self) -> Option<AnalysisTier> {
        if self.tier2_enabled {
            Some(AnalysisTier::Tier2)
        } else if self.tier1_enabled {
            Some(AnalysisTier::Tier1)
        } else if self.tier0_enabled {
            Some(AnalysisTier::Tier0)
        } else {
            None
        }
    }
}

/// Result of analyzing one message. Immutable after construction.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    /// Rules that matched, in declaration order
    pub matched_rules: Vec<RuleMatch>,
    /// Aggregated pattern confidence in [0, 1]
    pub pattern_confidence: f64,
    /// Topic tokens of the analyzed message (tier 1+)
    pub topics: BTreeSet<String>,
    /// Context-tracker heuristic probability (tier 1+)
    pub trigger_probability: f64,
    /// Topic distance from the previous turn (tier 2)
    pub semantic_shift: f64,
    /// Fused confidence after boosts, clamped to [0, 1]
    pub confidence: f64,
    /// Boosts that fired, for reasoning strings
    pub boosts: Vec<&'static str>,
    /// Highest tier actually executed
    pub tier: Option<AnalysisTier>,
    /// Wall time spent analyzing, in milliseconds
    pub elapsed_ms: f64,
}

impl AnalysisResult {
    fn empty() -> Self {
        Self {
            matched_rules: Vec::new(),
            pattern_confidence: 0.0,
            topics: BTreeSet::new(),
            trigger_probability: 0.0,
            semantic_shift: 0.0,
            confidence: 0.0,
            boosts: Vec::new(),
            tier: None,
            elapsed_ms: 0.0,
        }
    }
}

/// Confidence fusion weights.
const PATTERN_WEIGHT: f64 = 0.6;
const PROBABILITY_WEIGHT: f64 = 0.4;
const QUESTION_BOOST: f64 = 0.10;
const PAST_REFERENCE_BOOST: f64 = 0.15;
const SHIFT_BOOST: f64 = 0.20;

/// Orchestrates pattern matching and context tracking under tier budgets.
pub struct TieredAnalyzer {
    matcher: PatternMatcher,
    profile: PerformanceProfile,
}

impl Default for TieredAnalyzer {
    fn default() -> Self {
        Self::new(PatternMatcher::default(), PerformanceProfile::balanced())
    }
}

impl TieredAnalyzer {
    /// Create an analyzer with the given matcher and profile.
    pub fn new(matcher: PatternMatcher, profile: PerformanceProfile) -> Self {
        Self { matcher, profile }
    }

    /// The active performance profile.
    pub fn profile(&self) -> &PerformanceProfile {
        &self.profile
    }

    /// The underlying pattern matcher.
    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    /// Mutable access for adaptive retuning outside the hot path.
    pub fn matcher_mut(&mut self) -> &mut PatternMatcher {
        &mut self.matcher
    }

    /// Analyze a message against the tracked conversation window.
    ///
    /// Pure with respect to the tracker: the same message against an
    /// unchanged window yields an identical result. Never errors and never
    /// exceeds the profile ceiling by starting a tier that would overrun it.
    pub fn analyze(&self, text: &str, tracker: &ConversationTracker) -> AnalysisResult {
        let start = Instant::now();
        let mut result = AnalysisResult::empty();

        // Tier 0: pattern matching.
        if self.tier_allowed(AnalysisTier::Tier0, &start) {
            match catch_unwind(AssertUnwindSafe(|| {
                let matches = self.matcher.matches(text);
                let confidence = self.matcher.pattern_confidence(&matches);
                (matches, confidence)
            })) {
                Ok((matches, confidence)) => {
                    result.matched_rules = matches;
                    result.pattern_confidence = confidence;
                    result.tier = Some(AnalysisTier::Tier0);
                }
                Err(_) => {
                    tracing::warn!(tier = %AnalysisTier::Tier0, "analyzer tier faulted, contributing zero confidence");
                }
            }
        }

        // Tier 1: topic extraction and the context heuristic.
        if self.tier_allowed(AnalysisTier::Tier1, &start) {
            match catch_unwind(AssertUnwindSafe(|| {
                (extract_topics(text), tracker.trigger_probability(text))
            })) {
                Ok((topics, probability)) => {
                    result.topics = topics;
                    result.trigger_probability = probability;
                    result.tier = Some(AnalysisTier::Tier1);
                }
                Err(_) => {
                    tracing::warn!(tier = %AnalysisTier::Tier1, "analyzer tier faulted, contributing zero confidence");
                }
            }
        }

        // Tier 2: semantic shift against the previous turn.
        if self.tier_allowed(AnalysisTier::Tier2, &start) {
            // Tiers are cumulative: when tier 1 never produced topics, tier
            // 2 derives them itself rather than measuring shift against an
            // empty set.
            let tier1_completed = result.tier >= Some(AnalysisTier::Tier1);
            match catch_unwind(AssertUnwindSafe(|| {
                if tier1_completed {
                    tracker.shift_from_last(&result.topics)
                } else {
                    tracker.shift_from_last(&extract_topics(text))
                }
            })) {
                Ok(shift) => {
                    result.semantic_shift = shift;
                    result.tier = Some(AnalysisTier::Tier2);
                }
                Err(_) => {
                    tracing::warn!(tier = %AnalysisTier::Tier2, "analyzer tier faulted, contributing zero confidence");
                }
            }
        }

        self.fuse(&mut result);
        result.elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

        tracing::debug!(
            tier = ?result.tier,
            confidence = result.confidence,
            elapsed_ms = result.elapsed_ms,
            "analysis complete"
        );

        result
    }

    /// Whether a tier is enabled and would still fit under both its own
    /// cumulative budget and the overall ceiling.
    fn tier_allowed(&self, tier: AnalysisTier, start: &Instant) -> bool {
        let (enabled, budget_ms) = match tier {
            AnalysisTier::Tier0 => (self.profile.tier0_enabled, self.profile.tier0_budget_ms),
            AnalysisTier::Tier1 => (self.profile.tier1_enabled, self.profile.tier1_budget_ms),
            AnalysisTier::Tier2 => (self.profile.tier2_enabled, self.profile.tier2_budget_ms),
        };
        if !enabled {
            return false;
        }
        let elapsed_ms = start.elapsed().as_millis() as u64;
        elapsed_ms < budget_ms.min(self.profile.latency_ceiling_ms)
    }

    /// Fuse pattern confidence with the context heuristic, then apply
    /// additive, independent boosts, clamping to [0, 1].
    fn fuse(&self, result: &mut AnalysisResult) {
        let mut fused = result.pattern_confidence * PATTERN_WEIGHT
            + result.trigger_probability * PROBABILITY_WEIGHT;

        if result
            .matched_rules
            .iter()
            .any(|m| m.category == RuleCategory::Question)
        {
            fused += QUESTION_BOOST;
            result.boosts.push("question");
        }

        if result.matched_rules.iter().any(|m| {
            m.category == RuleCategory::PastReference || m.category == RuleCategory::ExplicitRecall
        }) {
            fused += PAST_REFERENCE_BOOST;
            result.boosts.push("past_reference");
        }

        if result.tier == Some(AnalysisTier::Tier2)
            && result.semantic_shift >= self.profile.shift_threshold
        {
            fused += SHIFT_BOOST;
            result.boosts.push("semantic_shift");
        }

        result.confidence = fused.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    #[test]
    fn test_no_signal_means_zero_confidence() {
        let analyzer = TieredAnalyzer::default();
        let tracker = ConversationTracker::default();

        let result = analyzer.analyze("Hello!", &tracker);
        assert!(result.matched_rules.is_empty());
        assert_eq!(result.confidence, 0.0);
        assert!(result.trigger_probability < 1e-9);
    }

    #[test]
    fn test_explicit_recall_scenario() {
        let analyzer = TieredAnalyzer::default();
        let tracker = ConversationTracker::default();

        let result =
            analyzer.analyze("What did we decide about the authentication system?", &tracker);
        assert!(result
            .matched_rules
            .iter()
            .any(|m| m.category == RuleCategory::ExplicitRecall));
        assert!(result.confidence >= 0.6);
        assert!(result.boosts.contains(&"question"));
        assert!(result.boosts.contains(&"past_reference"));
    }

    #[test]
    fn test_explicit_recall_lower_bound() {
        // With no other signal, the fusion formula bounds the fused
        // confidence below by base_weight * 0.6.
        let analyzer = TieredAnalyzer::default();
        let tracker = ConversationTracker::default();

        let result = analyzer.analyze("remind me about the build flags", &tracker);
        let rule_weight = 0.8;
        assert!(result.confidence >= rule_weight * 0.6);
    }

    #[test]
    fn test_idempotent_with_unchanged_window() {
        let analyzer = TieredAnalyzer::default();
        let mut tracker = ConversationTracker::default();
        tracker.observe_message(Role::User, "we discussed the parser refactor");

        let text = "How does the parser handle escapes?";
        let a = analyzer.analyze(text, &tracker);
        let b = analyzer.analyze(text, &tracker);

        assert_eq!(a.matched_rules, b.matched_rules);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.semantic_shift, b.semantic_shift);
        assert_eq!(a.tier, b.tier);
    }

    #[test]
    fn test_tier_monotonicity() {
        let tracker = ConversationTracker::default();

        let speed = TieredAnalyzer::new(PatternMatcher::default(), PerformanceProfile::speed_focused());
        let result = speed.analyze("what did we decide?", &tracker);
        assert_eq!(result.tier, Some(AnalysisTier::Tier0));
        assert_eq!(result.semantic_shift, 0.0);

        let balanced = TieredAnalyzer::default();
        let result = balanced.analyze("what did we decide?", &tracker);
        assert_eq!(result.tier, Some(AnalysisTier::Tier2));
        assert!(result.tier <= balanced.profile().max_tier());
    }

    #[test]
    fn test_shift_boost_requires_tier2() {
        let mut tracker = ConversationTracker::default();
        tracker.observe_message(Role::User, "kubernetes cluster networking");

        let tier1_only = TieredAnalyzer::new(PatternMatcher::default(), {
            let mut p = PerformanceProfile::balanced();
            p.tier2_enabled = false;
            p
        });
        let result = tier1_only.analyze("remind me about the parser grammar?", &tracker);
        assert!(!result.boosts.contains(&"semantic_shift"));

        let full = TieredAnalyzer::default();
        let result = full.analyze("remind me about the parser grammar?", &tracker);
        assert!(result.semantic_shift >= 0.5);
        assert!(result.boosts.contains(&"semantic_shift"));
    }

    #[test]
    fn test_zero_tier_budgets_run_nothing() {
        let mut profile = PerformanceProfile::balanced();
        profile.tier0_budget_ms = 0;
        profile.tier1_budget_ms = 0;
        profile.tier2_budget_ms = 0;
        let analyzer = TieredAnalyzer::new(PatternMatcher::default(), profile);
        let tracker = ConversationTracker::default();

        let result = analyzer.analyze("what did we decide?", &tracker);
        assert_eq!(result.tier, None);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_exhausted_tier_budget_stops_escalation() {
        // Tier 0 keeps its budget; the higher tiers have none left.
        let mut profile = PerformanceProfile::balanced();
        profile.tier1_budget_ms = 0;
        profile.tier2_budget_ms = 0;
        let analyzer = TieredAnalyzer::new(PatternMatcher::default(), profile);
        let tracker = ConversationTracker::default();

        let result = analyzer.analyze("what did we decide?", &tracker);
        assert_eq!(result.tier, Some(AnalysisTier::Tier0));
        assert!(result.topics.is_empty());
        assert_eq!(result.semantic_shift, 0.0);
    }

    #[test]
    fn test_tier2_without_tier1_derives_its_own_topics() {
        // An identical follow-up message means zero shift, whether or not
        // tier 1 ran; a skipped tier must never masquerade as topic drift.
        let mut tracker = ConversationTracker::default();
        tracker.observe_message(Role::User, "kubernetes cluster networking");

        let mut profile = PerformanceProfile::balanced();
        profile.tier1_enabled = false;
        let analyzer = TieredAnalyzer::new(PatternMatcher::default(), profile);

        let result = analyzer.analyze("kubernetes cluster networking", &tracker);
        assert_eq!(result.tier, Some(AnalysisTier::Tier2));
        assert_eq!(result.semantic_shift, 0.0);
        assert!(!result.boosts.contains(&"semantic_shift"));
    }

    #[test]
    fn test_zero_ceiling_runs_nothing() {
        let mut profile = PerformanceProfile::balanced();
        profile.latency_ceiling_ms = 0;
        let analyzer = TieredAnalyzer::new(PatternMatcher::default(), profile);
        let tracker = ConversationTracker::default();

        let result = analyzer.analyze("what did we decide?", &tracker);
        assert_eq!(result.tier, None);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_confidence_clamped() {
        let analyzer = TieredAnalyzer::default();
        let mut tracker = ConversationTracker::default();
        tracker.observe_message(Role::User, "unrelated earlier topic entirely");

        let result = analyzer.analyze(
            "Remind me what did we decide last session about auth, do you remember?",
            &tracker,
        );
        assert!(result.confidence <= 1.0);
        assert!(result.confidence >= 0.99);
    }
}
