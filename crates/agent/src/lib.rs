//! Concierge agent: the conversation pipeline.
//!
//! [`runtime::AgentRuntime`] wires the pieces together and is what the binaries talk to:
//! - [`classifier`] routes a message to the knowledge (SYSTEM) or data (DATABASE) branch
//! - [`database_agent`] turns a question into one SELECT, guarded by [`guardrails`]
//! - [`synthesizer`] narrates rows or role knowledge back to the user
//! - [`rate_limiter`] charges every completion call against the caller's hourly quota
//! - [`orchestrator`] runs a whole turn and persists both sides of it
//!
//! The language model is reached only through [`llm::CompletionClient`]. It never sees data the
//! caller's access policy does not allow, and nothing it writes is executed unless it is a SELECT.

pub mod classifier;
pub mod clock;
pub mod context;
pub mod database_agent;
pub mod guardrails;
pub mod llm;
pub mod orchestrator;
pub mod providers;
pub mod rate_limiter;
pub mod runtime;
pub mod sessions;
pub mod synthesizer;
pub mod title;

pub use clock::{Clock, ManualClock, SystemClock};
pub use llm::{CompletionClient, LlmError, ScriptedCompletionClient};
pub use runtime::{AgentRuntime, RuntimeDependencies, RuntimeSettings};
