//! Pattern rules and memory-seeking intent matching.
//!
//! The pattern matcher scores a single message against a weighted rule set.
//! It is a pure function of text: malformed or empty input yields an empty
//! match list, never an error. Rule weights can be adjusted by a bounded
//! adaptive multiplier that is retuned outside the analysis hot path.

use crate::error::{Error, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Category of a trigger pattern rule.
///
/// Categories carry a priority factor used when aggregating match strengths:
/// an explicit request to recall something dominates weaker signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    /// Direct request to recall stored context ("what did we decide about X")
    ExplicitRecall,
    /// Indirect recall signal ("similar to what we did before")
    ImplicitRecall,
    /// Reference to past work ("last session", "previously")
    PastReference,
    /// Question structure ("how does X work?")
    Question,
}

impl RuleCategory {
    /// Priority factor applied to match strengths in this category.
    pub fn priority(&self) -> f64 {
        match self {
            Self::ExplicitRecall => 1.0,
            Self::PastReference => 0.9,
            Self::ImplicitRecall => 0.8,
            Self::Question => 0.7,
        }
    }
}

impl std::fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExplicitRecall => write!(f, "explicit_recall"),
            Self::ImplicitRecall => write!(f, "implicit_recall"),
            Self::PastReference => write!(f, "past_reference"),
            Self::Question => write!(f, "question"),
        }
    }
}

/// A single immutable trigger rule: a case-insensitive pattern, its
/// category, and a base weight in [0, 1]. Loaded once at startup.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Short identifier used in decision reasoning.
    pub name: &'static str,
    /// Compiled case-insensitive pattern.
    pub pattern: Regex,
    /// Rule category.
    pub category: RuleCategory,
    /// Base match strength in [0, 1].
    pub base_weight: f64,
}

impl Rule {
    /// Compile a rule. Fails with [`Error::Config`] on an invalid pattern
    /// or an out-of-range weight.
    pub fn new(
        name: &'static str,
        pattern: &str,
        category: RuleCategory,
        base_weight: f64,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&base_weight) {
            return Err(Error::Config(format!(
                "rule '{}' weight {} outside [0, 1]",
                name, base_weight
            )));
        }
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Config(format!("rule '{}' pattern invalid: {}", name, e)))?;
        Ok(Self {
            name,
            pattern,
            category,
            base_weight,
        })
    }
}

/// A rule that matched a message, with its effective strength.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatch {
    /// Index of the rule in declaration order.
    pub rule_index: usize,
    /// Rule identifier.
    pub name: &'static str,
    /// Rule category.
    pub category: RuleCategory,
    /// Base weight times the adaptive multiplier, clamped to [0, 1.5].
    pub strength: f64,
}

/// Bounds for the adaptive per-rule multiplier.
const MULTIPLIER_MIN: f64 = 0.5;
const MULTIPLIER_MAX: f64 = 1.5;

/// The built-in rule set for memory-seeking intent.
pub fn default_rules() -> Vec<Rule> {
    // Built-in patterns always compile. User-supplied rule sets go
    // through Rule::new and surface Error::Config instead.
    let rule = |name, pattern, category, weight| {
        Rule::new(name, pattern, category, weight).expect("invalid built-in rule")
    };

    vec![
        rule(
            "explicit_decide",
            r"what (did|have) we (decide|discuss|do|agree|choose|pick)",
            RuleCategory::ExplicitRecall,
            0.9,
        ),
        rule(
            "explicit_remember",
            r"\b(do you )?remember (when|what|how|that|the)\b",
            RuleCategory::ExplicitRecall,
            0.85,
        ),
        rule(
            "explicit_recall_verb",
            r"\b(recall|remind me)\b",
            RuleCategory::ExplicitRecall,
            0.8,
        ),
        rule(
            "past_session",
            r"\b(last (time|session|week)|previous(ly)?|earlier|yesterday)\b",
            RuleCategory::PastReference,
            0.6,
        ),
        rule(
            "past_we_did",
            r"\b(did we|we (decided|agreed|discussed|implemented|built|fixed|chose))\b",
            RuleCategory::PastReference,
            0.6,
        ),
        rule(
            "implicit_similar",
            r"\b(similar to|like (we|last)|the same (way|approach)|as before)\b",
            RuleCategory::ImplicitRecall,
            0.5,
        ),
        rule(
            "implicit_continue",
            r"\b(continue (from|where)|pick up where|back to (the|our))\b",
            RuleCategory::ImplicitRecall,
            0.5,
        ),
        rule(
            "question_opener",
            r"^\s*(what|when|why|how|where|which|who)\b.*\?",
            RuleCategory::Question,
            0.3,
        ),
    ]
}

/// Pattern matcher over a weighted rule set.
///
/// Match counting is done with atomics so that scoring stays `&self` and
/// never blocks. The adaptive multipliers are only rewritten by an explicit
/// [`PatternMatcher::retune`] call, keeping the hot path deterministic.
pub struct PatternMatcher {
    rules: Vec<Rule>,
    /// Global sensitivity multiplier applied on top of per-rule tuning.
    sensitivity: f64,
    /// Whether retune() adjusts multipliers from the counters.
    adaptive: bool,
    /// Per-rule effective multipliers, clamped to [0.5, 1.5].
    multipliers: Vec<f64>,
    /// Per-rule match counts (in-memory only).
    match_counts: Vec<AtomicU64>,
    /// Per-rule counts of matches that led to a confirmed trigger.
    trigger_counts: Vec<AtomicU64>,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl PatternMatcher {
    /// Create a matcher over the given rule set.
    pub fn new(rules: Vec<Rule>) -> Self {
        let n = rules.len();
        Self {
            rules,
            sensitivity: 1.0,
            adaptive: false,
            multipliers: vec![1.0; n],
            match_counts: (0..n).map(|_| AtomicU64::new(0)).collect(),
            trigger_counts: (0..n).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Set the global sensitivity multiplier.
    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    /// Enable adaptive retuning from match/trigger counters.
    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// The rules in declaration order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Score a message against every rule. Empty or arbitrary input is
    /// fine; no match yields an empty list.
    pub fn matches(&self, text: &str) -> Vec<RuleMatch> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.pattern.is_match(text) {
                self.match_counts[i].fetch_add(1, Ordering::Relaxed);
                let multiplier =
                    (self.multipliers[i] * self.sensitivity).clamp(MULTIPLIER_MIN, MULTIPLIER_MAX);
                out.push(RuleMatch {
                    rule_index: i,
                    name: rule.name,
                    category: rule.category,
                    strength: rule.base_weight * multiplier,
                });
            }
        }
        out
    }

    /// Aggregate matches into a single confidence in [0, 1]:
    /// the top-3 priority-weighted strengths, summed and capped.
    /// Ties between equal weighted strengths keep declaration order.
    pub fn pattern_confidence(&self, matches: &[RuleMatch]) -> f64 {
        if matches.is_empty() {
            return 0.0;
        }

        let mut weighted: Vec<(usize, f64)> = matches
            .iter()
            .map(|m| (m.rule_index, m.strength * m.category.priority()))
            .collect();
        // Stable sort preserves declaration order on ties.
        weighted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let sum: f64 = weighted.iter().take(3).map(|(_, w)| w).sum();
        sum.min(1.0)
    }

    /// Record that a set of matched rules contributed to a confirmed
    /// trigger. Feeds the adaptive multiplier; never blocks.
    pub fn record_trigger(&self, matches: &[RuleMatch]) {
        for m in matches {
            if let Some(count) = self.trigger_counts.get(m.rule_index) {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Recompute per-rule multipliers from the counters.
    ///
    /// Rules whose matches reliably lead to triggers drift toward 1.5,
    /// noisy rules toward 0.5. Not called from the analysis path, so
    /// analyzer timing stays deterministic. A no-op unless adaptive mode
    /// is enabled.
    pub fn retune(&mut self) {
        if !self.adaptive {
            return;
        }
        for i in 0..self.rules.len() {
            let matched = self.match_counts[i].load(Ordering::Relaxed);
            if matched == 0 {
                continue;
            }
            let triggered = self.trigger_counts[i].load(Ordering::Relaxed);
            let ratio = triggered as f64 / matched as f64;
            self.multipliers[i] = (0.5 + ratio).clamp(MULTIPLIER_MIN, MULTIPLIER_MAX);
        }
    }

    /// Match counts per rule, in declaration order.
    pub fn match_counts(&self) -> Vec<u64> {
        self.match_counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}
