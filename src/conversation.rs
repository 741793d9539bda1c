//! Conversation context tracking: bounded turn window, topic tokens,
//! and semantic-shift scoring between consecutive turns.
//!
//! Topic extraction is a deliberate precision/latency trade-off: a
//! stop-word-filtered token-frequency heuristic, not NLP. Analysis methods
//! take `&self` so that scoring a message never mutates the window; the
//! caller decides when a turn is actually observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// The role of a conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User/human input
    User,
    /// Assistant/model response
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single turn in the tracked conversation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Who produced the turn
    pub role: Role,
    /// Raw message text
    pub text: String,
    /// When the turn was observed
    pub timestamp: DateTime<Utc>,
    /// Derived topic tokens
    pub topics: BTreeSet<String>,
}

impl ConversationTurn {
    /// Create a turn, deriving its topic tokens from the text.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let topics = extract_topics(&text);
        Self {
            role,
            text,
            timestamp: Utc::now(),
            topics,
        }
    }
}

/// Stop words excluded from topic extraction.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "day", "get", "has", "him", "his", "how", "now", "new", "old", "see", "two",
    "way", "who", "did", "its", "let", "say", "she", "too", "use", "that", "this", "with",
    "have", "from", "they", "what", "were", "been", "when", "will", "would", "there", "their",
    "about", "which", "could", "should", "them", "then", "than", "also", "into", "just", "some",
    "your", "does", "please", "want", "need", "make", "like",
];

/// Maximum topic tokens kept per turn.
const MAX_TOPICS: usize = 12;

/// Extract topic tokens from text: lowercase alphanumeric tokens of three
/// or more characters, stop words removed, capped to the most frequent.
pub fn extract_topics(text: &str) -> BTreeSet<String> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
    {
        let token = token.to_lowercase();
        if STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        *freq.entry(token).or_insert(0) += 1;
    }

    if freq.len() <= MAX_TOPICS {
        return freq.into_keys().collect();
    }
    let mut by_freq: Vec<(String, usize)> = freq.into_iter().collect();
    by_freq.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    by_freq.into_iter().take(MAX_TOPICS).map(|(t, _)| t).collect()
}

/// Tokens that signal temporal or past-reference intent.
const TEMPORAL_TOKENS: &[&str] = &[
    "before", "previous", "previously", "last", "earlier", "ago", "yesterday", "recall",
    "remember", "history",
];

/// Question openers used by the trigger-probability heuristic.
const QUESTION_OPENERS: &[&str] = &["what", "when", "why", "how", "where", "which", "who"];

/// Bounded rolling window of recent conversation turns for one session.
#[derive(Debug, Clone)]
pub struct ConversationTracker {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
}

impl Default for ConversationTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ConversationTracker {
    /// Create a tracker keeping the last `capacity` turns.
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Append a turn, evicting the oldest on overflow.
    pub fn observe(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// Convenience: observe a turn built from role and text.
    pub fn observe_message(&mut self, role: Role, text: impl Into<String>) {
        self.observe(ConversationTurn::new(role, text));
    }

    /// Number of turns currently tracked.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Union of topic tokens across the tracked window.
    pub fn current_topics(&self) -> BTreeSet<String> {
        self.turns
            .iter()
            .flat_map(|t| t.topics.iter().cloned())
            .collect()
    }

    /// Normalized topic-overlap distance between the two most recent turns:
    /// `1 - |intersection| / |union|`, 0 when both topic sets are empty or
    /// fewer than two turns are tracked.
    pub fn semantic_shift(&self) -> f64 {
        let n = self.turns.len();
        if n < 2 {
            return 0.0;
        }
        topic_distance(&self.turns[n - 2].topics, &self.turns[n - 1].topics)
    }

    /// Topic-overlap distance between the given topic set and the most
    /// recent tracked turn. 0 when there is no prior turn.
    pub fn shift_from_last(&self, topics: &BTreeSet<String>) -> f64 {
        match self.turns.back() {
            Some(last) => topic_distance(&last.topics, topics),
            None => 0.0,
        }
    }

    /// Fraction of the given topics not seen anywhere in the window.
    /// Defined as 0 when the window is empty (nothing to be novel against)
    /// or the message carries no topics.
    pub fn topic_novelty(&self, topics: &BTreeSet<String>) -> f64 {
        if self.turns.is_empty() || topics.is_empty() {
            return 0.0;
        }
        let known = self.current_topics();
        let new = topics.iter().filter(|t| !known.contains(*t)).count();
        new as f64 / topics.len() as f64
    }

    /// Secondary trigger heuristic for a candidate message: additive blend
    /// of topic novelty (≤0.4), question markers (+0.3), and temporal or
    /// past-reference tokens (+0.3), capped at 1.0.
    pub fn trigger_probability(&self, text: &str) -> f64 {
        let topics = extract_topics(text);
        let mut p = self.topic_novelty(&topics) * 0.4;

        let lower = text.to_lowercase();
        let is_question = lower.contains('?')
            || QUESTION_OPENERS
                .iter()
                .any(|q| lower.trim_start().starts_with(q));
        if is_question {
            p += 0.3;
        }

        let has_temporal = lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|t| TEMPORAL_TOKENS.contains(&t));
        if has_temporal {
            p += 0.3;
        }

        p.min(1.0)
    }
}

/// `1 - |intersection| / |union|` over two topic sets, 0 when both empty.
fn topic_distance(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    1.0 - intersection as f64 / union as f64
}
