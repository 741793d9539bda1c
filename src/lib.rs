//! # recall-core
//!
//! Adaptive trigger and retrieval client for a conversational memory
//! service. Decides, inside a latency budget, when a message warrants
//! pulling stored context forward, and talks to the service over whichever
//! transport negotiation lands on.
//!
//! ## Core Components
//!
//! - **Patterns**: regex rules that recognize recall-shaped messages
//! - **Conversation**: sliding window of turns and topic drift
//! - **Analyzer**: tiered analysis under a configurable latency budget
//! - **Trigger**: threshold-and-cooldown verdicts with reasoning strings
//! - **Client**: protocol-negotiating memory service client
//! - **Hooks**: session lifecycle glue from prompt to retrieval
//!
//! ## Example
//!
//! ```rust,ignore
//! use recall_core::{
//!     default_rules, ConversationTracker, PatternMatcher, PerformanceProfile,
//!     TieredAnalyzer, TriggerEngine, DEFAULT_COOLDOWN_MS, DEFAULT_TRIGGER_THRESHOLD,
//! };
//!
//! let analyzer = TieredAnalyzer::new(
//!     PatternMatcher::new(default_rules()),
//!     PerformanceProfile::balanced(),
//! );
//! let mut engine = TriggerEngine::new(DEFAULT_TRIGGER_THRESHOLD, DEFAULT_COOLDOWN_MS);
//! let tracker = ConversationTracker::default();
//!
//! let analysis = analyzer.analyze("What did we decide about auth?", &tracker);
//! let decision = engine.evaluate(&analysis);
//! if decision.should_trigger {
//!     println!("retrieving: {}", decision.reasoning);
//! }
//! ```

pub mod analyzer;
pub mod client;
pub mod conversation;
pub mod error;
pub mod events;
pub mod hooks;
pub mod patterns;
pub mod trigger;

// Re-exports for convenience
pub use analyzer::{AnalysisResult, AnalysisTier, PerformanceProfile, TieredAnalyzer};
pub use client::{
    ConnectMode, ConnectionInfo, ConnectionNegotiator, ConnectionState, HealthStatus,
    HttpEndpoint, InMemoryService, MemoryClient, MemoryRecord, Protocol, StdioEndpoint,
    Transport, TransportEndpoint,
};
pub use conversation::{ConversationTracker, ConversationTurn, Role};
pub use error::{Error, Result};
pub use events::{ClientEvent, ClientEventType, EventSender};
pub use hooks::{format_context, PromptOutcome, SessionHooks};
pub use patterns::{default_rules, PatternMatcher, Rule, RuleCategory, RuleMatch};
pub use trigger::{
    SessionTriggerState, TriggerDecision, TriggerEngine, TriggerPhase, DEFAULT_COOLDOWN_MS,
    DEFAULT_TRIGGER_THRESHOLD,
};
