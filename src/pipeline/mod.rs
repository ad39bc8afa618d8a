//! Message workflow pipeline.
//!
//! Every inbound message flows through:
//! 1. `TriageClassifier::classify()`: label, with advisory sender hints
//! 2. `Drafter::draft()`: reply text biased by learned preferences
//! 3. Draft checkpoint: durable pause for the human
//! 4. `WorkflowEngine::resolve()`: approve / edit / deny, then send and learn
//!
//! **No reply leaves without a resolved checkpoint.**

pub mod engine;
pub mod oracle;
pub mod retry;
pub mod rules;
pub mod state;
pub mod types;

pub use engine::{EngineStats, Progress, RecoveryReport, WorkflowEngine};
pub use oracle::{Classification, Drafter, LogOutbox, ReplySender, TemplateDrafter, TriageClassifier};
pub use rules::RulesClassifier;
