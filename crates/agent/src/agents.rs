use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::{AgentId, ApplicationError, AuthContext, RoomId, WorkflowType};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::llm::{ConversationEntry, ConversationRequest, HistoryMessage, ToolCall};
use crate::prompts::PromptLibrary;
use crate::session::ConversationSessionManager;
use crate::tools::{ToolInvocationBridge, ToolScope};

const EMPTY_REPLY: &str = "Je n'ai pas de réponse à vous apporter pour le moment. Pouvez-vous préciser votre demande ?";

/// One routed chat message as seen by a workflow handler.
#[derive(Clone, Copy, Debug)]
pub struct HandlerTurn<'a> {
    pub message: &'a str,
    pub history: &'a [HistoryMessage],
    pub auth: &'a AuthContext,
    pub correlation_id: &'a str,
}

impl HandlerTurn<'_> {
    pub fn room_id(&self) -> &RoomId {
        &self.auth.room_id
    }
}

#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    fn workflow(&self) -> WorkflowType;
    async fn handle(&self, turn: &HandlerTurn<'_>) -> Result<String, ApplicationError>;
}

pub struct TurnRequest<'a> {
    pub agent_id: &'a AgentId,
    pub message: &'a str,
    pub instructions: Option<String>,
    pub scope: ToolScope,
    pub auth: &'a AuthContext,
    /// Tool whose call ends the turn with its arguments instead of being run.
    pub intercept: Option<&'a str>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnOutcome {
    pub text: String,
    pub intercepted: Option<Value>,
    pub tool_calls: Vec<String>,
}

/// Drives one model turn: sends the message, executes requested tools for a
/// bounded number of rounds and returns the final answer.
pub struct TurnRunner {
    sessions: Arc<ConversationSessionManager>,
    tools: Arc<ToolInvocationBridge>,
    max_tool_rounds: u32,
    /// Intercepted calls still owed a result, sent ahead of the room's next message.
    pending_results: DashMap<RoomId, Vec<ConversationEntry>>,
}

impl TurnRunner {
    pub fn new(
        sessions: Arc<ConversationSessionManager>,
        tools: Arc<ToolInvocationBridge>,
        max_tool_rounds: u32,
    ) -> Self {
        Self { sessions, tools, max_tool_rounds, pending_results: DashMap::new() }
    }

    pub fn sessions(&self) -> &ConversationSessionManager {
        &self.sessions
    }

    pub fn tools(&self) -> &ToolInvocationBridge {
        &self.tools
    }

    pub async fn run(&self, request: TurnRequest<'_>) -> Result<TurnOutcome, ApplicationError> {
        let room_id = &request.auth.room_id;
        let tools = self.tools.tools_in_scope(&request.scope);

        let owed = self.pending_results.remove(room_id).map(|(_, entries)| entries).unwrap_or_default();
        let mut inputs = if self.sessions.should_create_new_conversation(room_id, request.agent_id) {
            Vec::new()
        } else {
            owed
        };
        inputs.push(ConversationEntry::UserMessage(request.message.to_owned()));

        let first = ConversationRequest { inputs, instructions: request.instructions.clone(), tools: tools.clone() };
        let mut reply = self.sessions.converse(room_id, request.agent_id, &first).await?;
        let mut outcome = TurnOutcome::default();
        let mut rounds = 0;

        loop {
            let calls = reply.tool_calls();
            if calls.is_empty() {
                outcome.text = reply.text();
                return Ok(outcome);
            }

            let intercept = request.intercept.filter(|name| tools.iter().any(|tool| tool.name == *name));
            if let Some(intercept) = intercept {
                if let Some(arguments) =
                    calls.iter().find(|call| call.name == intercept).map(|call| call.arguments.clone())
                {
                    debug!(
                        event_name = "agent.tool_intercepted",
                        room_id = %room_id,
                        tool = intercept,
                        "structured step output received"
                    );
                    // Sibling calls still run; only the intercepted one is acknowledged blindly.
                    let mut owed = Vec::with_capacity(calls.len());
                    for call in calls {
                        if call.name == intercept {
                            outcome.tool_calls.push(call.name.clone());
                            owed.push(ConversationEntry::ToolResult {
                                tool_call_id: call.id,
                                name: call.name,
                                result: "ok".to_owned(),
                            });
                        } else {
                            owed.push(self.dispatch(&request, call, &mut outcome).await);
                        }
                    }
                    self.pending_results.insert(room_id.clone(), owed);
                    outcome.intercepted = Some(arguments);
                    outcome.text = reply.text();
                    return Ok(outcome);
                }
            }

            if rounds >= self.max_tool_rounds {
                info!(
                    event_name = "agent.turn_limit_exceeded",
                    room_id = %room_id,
                    rounds,
                    "model kept requesting tools"
                );
                return Err(ApplicationError::TurnLimitExceeded { rounds });
            }
            rounds += 1;

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.dispatch(&request, call, &mut outcome).await);
            }
            debug!(
                event_name = "agent.tool_round_completed",
                room_id = %room_id,
                round = rounds,
                calls = results.len(),
                "tool results sent back to the model"
            );

            let follow_up = ConversationRequest { inputs: results, instructions: None, tools: tools.clone() };
            reply = self.sessions.append_conversation(room_id, &follow_up).await?;
        }
    }

    async fn dispatch(&self, request: &TurnRequest<'_>, call: ToolCall, outcome: &mut TurnOutcome) -> ConversationEntry {
        let result = self.tools.call_tool_in_scope(&request.scope, &call.name, call.arguments, request.auth).await;
        outcome.tool_calls.push(call.name.clone());
        ConversationEntry::ToolResult { tool_call_id: call.id, name: call.name, result: result.to_model_string() }
    }
}

/// Single-turn agent for every workflow without a step machine.
pub struct GeneralAgent {
    workflow: WorkflowType,
    agent_id: AgentId,
    runner: Arc<TurnRunner>,
    prompts: Arc<PromptLibrary>,
    clock: Arc<dyn Clock>,
}

impl GeneralAgent {
    pub fn new(
        workflow: WorkflowType,
        agent_id: AgentId,
        runner: Arc<TurnRunner>,
        prompts: Arc<PromptLibrary>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { workflow, agent_id, runner, prompts, clock }
    }
}

#[async_trait]
impl WorkflowHandler for GeneralAgent {
    fn workflow(&self) -> WorkflowType {
        self.workflow
    }

    async fn handle(&self, turn: &HandlerTurn<'_>) -> Result<String, ApplicationError> {
        let instructions =
            self.prompts.agent(self.workflow, turn.auth.user.as_ref(), self.clock.now().date_naive())?;
        let outcome = self
            .runner
            .run(TurnRequest {
                agent_id: &self.agent_id,
                message: turn.message,
                instructions: Some(instructions),
                scope: ToolScope::Workflow(self.workflow),
                auth: turn.auth,
                intercept: None,
            })
            .await?;

        if outcome.text.trim().is_empty() {
            return Ok(EMPTY_REPLY.to_owned());
        }
        Ok(outcome.text)
    }
}
