use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concierge_core::{AgentId, ApplicationError, ConversationId, WorkflowType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::ToolDescriptor;

pub const ROUTE_TO_WORKFLOW: &str = "route_to_workflow";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A prior chat message in the room, as delivered by the chat transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self { role: MessageRole::User, content: content.into(), sent_at }
    }

    pub fn assistant(content: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into(), sent_at }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationRequest {
    pub message: String,
    pub history: Vec<HistoryMessage>,
    pub current_workflow: Option<WorkflowType>,
    pub instructions: String,
    pub temperature: f32,
    /// Forced structured output the model must call.
    pub tool: ToolDescriptor,
}

/// Raw classifier answer. Interpretation happens in the router so every
/// provider shares the same fallback chain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassifierReply {
    pub tool_arguments: Option<Value>,
    pub content: Option<String>,
}

#[async_trait]
pub trait WorkflowClassifier: Send + Sync {
    async fn classify_workflow(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassifierReply, ApplicationError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConversationEntry {
    UserMessage(String),
    ToolResult { tool_call_id: String, name: String, result: String },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationRequest {
    pub inputs: Vec<ConversationEntry>,
    pub instructions: Option<String>,
    pub tools: Vec<ToolDescriptor>,
}

impl ConversationRequest {
    pub fn user_message(
        message: impl Into<String>,
        instructions: Option<String>,
        tools: Vec<ToolDescriptor>,
    ) -> Self {
        Self { inputs: vec![ConversationEntry::UserMessage(message.into())], instructions, tools }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConversationOutput {
    Message(String),
    ToolCall(ToolCall),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConversationReply {
    pub conversation_id: ConversationId,
    pub outputs: Vec<ConversationOutput>,
}

impl ConversationReply {
    pub fn text(&self) -> String {
        self.outputs
            .iter()
            .filter_map(|output| match output {
                ConversationOutput::Message(text) => Some(text.trim()),
                ConversationOutput::ToolCall(_) => None,
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.outputs
            .iter()
            .filter_map(|output| match output {
                ConversationOutput::ToolCall(call) => Some(call.clone()),
                ConversationOutput::Message(_) => None,
            })
            .collect()
    }
}

/// Stateful conversation API. Every call returns the id to use next.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn start_conversation(
        &self,
        agent_id: &AgentId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError>;

    async fn append_conversation(
        &self,
        conversation_id: &ConversationId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError>;

    /// Called once no room refers to `conversation_id` anymore. Providers
    /// that keep conversations server-side have nothing to drop.
    fn release_conversation(&self, _conversation_id: &ConversationId) {}
}

pub fn route_to_workflow_tool() -> ToolDescriptor {
    let workflows = WorkflowType::ALL.iter().map(WorkflowType::as_str).collect::<Vec<_>>();
    let described = WorkflowType::ALL
        .iter()
        .map(|workflow| format!("{}: {}", workflow.as_str(), workflow.description()))
        .collect::<Vec<_>>()
        .join("; ");

    ToolDescriptor::new(
        ROUTE_TO_WORKFLOW,
        format!("Route the user message to exactly one workflow. {described}"),
        json!({
            "type": "object",
            "properties": {
                "workflow": {"type": "string", "enum": workflows},
                "reason": {"type": "string"}
            },
            "required": ["workflow"]
        }),
    )
}
