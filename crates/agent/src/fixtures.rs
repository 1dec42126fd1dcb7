//! Scripted stand-ins for the provider capabilities, shared by the unit tests
//! and the end-to-end scenarios.

use std::collections::VecDeque;

use async_trait::async_trait;
use concierge_core::{AgentId, ApplicationError, ConversationId, WorkflowType};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::llm::{
    ClassificationRequest, ClassifierReply, ConversationApi, ConversationOutput, ConversationReply,
    ConversationRequest, ToolCall, WorkflowClassifier,
};

pub fn message(text: impl Into<String>) -> ConversationOutput {
    ConversationOutput::Message(text.into())
}

pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> ConversationOutput {
    ConversationOutput::ToolCall(ToolCall { id: id.into(), name: name.into(), arguments })
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCall {
    Start { agent_id: AgentId, store: bool, request: ConversationRequest },
    Append { conversation_id: ConversationId, request: ConversationRequest },
}

impl RecordedCall {
    pub fn request(&self) -> &ConversationRequest {
        match self {
            Self::Start { request, .. } | Self::Append { request, .. } => request,
        }
    }
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<Result<Vec<ConversationOutput>, ApplicationError>>,
    calls: Vec<RecordedCall>,
    issued: u32,
}

/// Conversation API answering from a queue. An exhausted script answers
/// with a plain acknowledgement.
#[derive(Default)]
pub struct ScriptedConversation {
    state: Mutex<ScriptState>,
}

impl ScriptedConversation {
    pub fn new(script: impl IntoIterator<Item = Vec<ConversationOutput>>) -> Self {
        let replies = script.into_iter().map(Ok).collect();
        Self { state: Mutex::new(ScriptState { replies, ..ScriptState::default() }) }
    }

    pub async fn push(&self, outputs: Vec<ConversationOutput>) {
        self.state.lock().await.replies.push_back(Ok(outputs));
    }

    pub async fn push_error(&self, error: ApplicationError) {
        self.state.lock().await.replies.push_back(Err(error));
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    async fn answer(&self, call: RecordedCall) -> Result<ConversationReply, ApplicationError> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        let outputs = state.replies.pop_front().unwrap_or_else(|| Ok(vec![message("D'accord.")]))?;
        state.issued += 1;
        Ok(ConversationReply {
            conversation_id: ConversationId::new(format!("conv-{}", state.issued)),
            outputs,
        })
    }
}

#[async_trait]
impl ConversationApi for ScriptedConversation {
    async fn start_conversation(
        &self,
        agent_id: &AgentId,
        request: &ConversationRequest,
        store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        self.answer(RecordedCall::Start { agent_id: agent_id.clone(), store, request: request.clone() })
            .await
    }

    async fn append_conversation(
        &self,
        conversation_id: &ConversationId,
        request: &ConversationRequest,
        _store: bool,
    ) -> Result<ConversationReply, ApplicationError> {
        self.answer(RecordedCall::Append {
            conversation_id: conversation_id.clone(),
            request: request.clone(),
        })
        .await
    }
}

#[derive(Default)]
struct ClassifierState {
    replies: VecDeque<Result<ClassifierReply, ApplicationError>>,
    requests: Vec<ClassificationRequest>,
}

/// Classifier returning queued replies, then `fallback`.
pub struct StaticClassifier {
    state: Mutex<ClassifierState>,
    fallback: Result<ClassifierReply, ApplicationError>,
}

impl StaticClassifier {
    pub fn routing_to(workflow: WorkflowType) -> Self {
        Self {
            state: Mutex::new(ClassifierState::default()),
            fallback: Ok(ClassifierReply {
                tool_arguments: Some(json!({"workflow": workflow.as_str()})),
                content: None,
            }),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(ClassifierState::default()),
            fallback: Err(ApplicationError::Classification(message.into())),
        }
    }

    pub async fn push(&self, reply: Result<ClassifierReply, ApplicationError>) {
        self.state.lock().await.replies.push_back(reply);
    }

    pub async fn requests(&self) -> Vec<ClassificationRequest> {
        self.state.lock().await.requests.clone()
    }
}

#[async_trait]
impl WorkflowClassifier for StaticClassifier {
    async fn classify_workflow(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassifierReply, ApplicationError> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        state.replies.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}
