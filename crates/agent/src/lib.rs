//! Agent Runtime - LLM-backed conversation orchestration for the residents portal
//!
//! This crate is the "brain" of the concierge: it turns a chat message from a
//! resident into a reply, keeping per-room state across messages.
//!
//! # Architecture
//!
//! Every message goes through a constrained loop:
//! 1. **Routing** (`router`) - classify the message into a workflow, with
//!    short follow-ups and reservation keywords short-circuiting the model
//! 2. **Guardrails** (`guardrails`) - refuse workflows and tools the chat
//!    identity may not use
//! 3. **Workflow handling** (`agents`, `reservation`) - run one remote
//!    conversation turn, executing the tools the model asks for
//! 4. **State** (`context`, `session`) - remember the workflow, the
//!    reservation step and the remote conversation of each room
//!
//! # Key Types
//!
//! - `AgentRuntime` - assembles everything from configuration
//! - `Router` - per-message entry point
//! - `ToolInvocationBridge` - tool registry with step and workflow scopes
//! - `ConversationApi` / `WorkflowClassifier` - pluggable LLM provider seams
//!
//! # Safety Principle
//!
//! The LLM proposes reservation steps; it never decides them. Step transitions
//! are validated by the flow engine in `concierge-core`, and mutating tools are
//! only reachable from the steps that allow them.

pub mod agents;
pub mod catalog;
pub mod clock;
pub mod context;
pub mod conversation;
pub mod fixtures;
pub mod guardrails;
pub mod http;
pub mod llm;
pub mod portal;
pub mod prompts;
pub mod reservation;
pub mod router;
pub mod runtime;
pub mod session;
pub mod tools;

pub use runtime::{AgentRuntime, RuntimeParts};
