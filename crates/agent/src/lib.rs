//! The agent runtime: the streaming turn loop and its supporting machinery.
//!
//! A turn takes a user message, streams a completion from the active model,
//! dispatches tool calls, and appends the final assistant message to the
//! session. Around that loop sit context compaction, retry/failover across
//! a model fallback chain, auth-profile rotation, per-session + global
//! concurrency lanes, and run-addressed cancellation. Everything observable
//! is published onto the event bus.

pub mod cancel;
pub mod compact;
pub mod queue;
pub mod runtime;
pub mod thinking;

pub use cancel::{CancelToken, RunRegistry};
pub use queue::{QueueManager, QueueStats};
pub use runtime::{AgentRuntime, ProviderFactory, RuntimeConfig, TurnOutcome, TurnRequest};
pub use thinking::{ThinkingExtractor, ThinkingMode};
