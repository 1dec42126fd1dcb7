use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink};
use concierge_core::flows::{FlowDefinition, SpaceReservationFlow, SpaceStep};
use concierge_core::{AuthContext, RoomId, WorkflowType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::guardrails::{GuardrailDecision, GuardrailIntent, GuardrailPolicy};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolVisibility {
    Always,
    Steps(BTreeSet<SpaceStep>),
    Workflows(BTreeSet<WorkflowType>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolAccess {
    ReadOnly,
    Mutating,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub visibility: ToolVisibility,
    pub access: ToolAccess,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            visibility: ToolVisibility::Always,
            access: ToolAccess::ReadOnly,
        }
    }

    /// Scopes the tool to the reservation steps whose whitelist names it.
    pub fn for_reservation_steps(mut self) -> Self {
        let flow = SpaceReservationFlow;
        let steps = SpaceStep::ALL
            .into_iter()
            .filter(|step| flow.tool_whitelist(*step).contains(&self.name.as_str()))
            .collect();
        self.visibility = ToolVisibility::Steps(steps);
        self
    }

    pub fn for_workflows(mut self, workflows: impl IntoIterator<Item = WorkflowType>) -> Self {
        self.visibility = ToolVisibility::Workflows(workflows.into_iter().collect());
        self
    }

    pub fn mutating(mut self) -> Self {
        self.access = ToolAccess::Mutating;
        self
    }

    pub fn is_visible_in(&self, scope: &ToolScope) -> bool {
        match (&self.visibility, scope) {
            (ToolVisibility::Always, _) => true,
            (ToolVisibility::Steps(steps), ToolScope::Step(step)) => steps.contains(step),
            (ToolVisibility::Workflows(workflows), ToolScope::Workflow(workflow)) => {
                workflows.contains(workflow)
            }
            _ => false,
        }
    }
}

/// What a model turn may see: one reservation step, or a whole workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolScope {
    Step(SpaceStep),
    Workflow(WorkflowType),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContentPart {
    Text(String),
    Structured(Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub is_error: bool,
    pub content: Vec<ContentPart>,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self { is_error: false, content: vec![ContentPart::Text(text.into())] }
    }

    pub fn structured(value: Value) -> Self {
        Self { is_error: false, content: vec![ContentPart::Structured(value)] }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { is_error: true, content: vec![ContentPart::Text(message.into())] }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(ContentPart::Text(text.into()));
        self
    }

    /// Flattened form handed back to the model as a tool result.
    pub fn to_model_string(&self) -> String {
        let body = self
            .content
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => text.clone(),
                ContentPart::Structured(value) => value.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        if self.is_error {
            format!("ERROR: {body}")
        } else {
            body
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn execute(&self, input: Value, auth: &AuthContext) -> Result<ToolCallResult, ToolError>;
}

pub fn parse_arguments<T>(input: Value) -> Result<T, ToolError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(input).map_err(|error| ToolError::InvalidArguments(error.to_string()))
}

pub struct ToolInvocationBridge {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    guardrails: GuardrailPolicy,
    audit: Arc<dyn AuditSink>,
    sessions: DashMap<RoomId, String>,
}

impl Default for ToolInvocationBridge {
    fn default() -> Self {
        Self::new(GuardrailPolicy::default(), Arc::new(NoopAuditSink))
    }
}

impl ToolInvocationBridge {
    pub fn new(guardrails: GuardrailPolicy, audit: Arc<dyn AuditSink>) -> Self {
        Self { tools: BTreeMap::new(), guardrails, audit, sessions: DashMap::new() }
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.descriptor().name, Arc::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|tool| tool.descriptor()).collect()
    }

    pub fn tools_in_scope(&self, scope: &ToolScope) -> Vec<ToolDescriptor> {
        self.list_tools().into_iter().filter(|tool| tool.is_visible_in(scope)).collect()
    }

    pub fn tools_for_step(&self, step: SpaceStep) -> Vec<ToolDescriptor> {
        self.tools_in_scope(&ToolScope::Step(step))
    }

    /// Stable per-room token grouping every call made for one room.
    pub fn get_or_create_session(&self, room_id: &RoomId) -> String {
        self.sessions
            .entry(room_id.clone())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .value()
            .clone()
    }

    pub fn forget_session(&self, room_id: &RoomId) -> bool {
        self.sessions.remove(room_id).is_some()
    }

    pub fn clear_sessions(&self) -> usize {
        let mut cleared = 0;
        self.sessions.retain(|_, _| {
            cleared += 1;
            false
        });
        cleared
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Refuses tools the scope does not expose, then defers to `call_tool`.
    pub async fn call_tool_in_scope(
        &self,
        scope: &ToolScope,
        name: &str,
        args: Value,
        auth: &AuthContext,
    ) -> ToolCallResult {
        let visible = self.tools.get(name).is_some_and(|tool| tool.descriptor().is_visible_in(scope));
        if !visible {
            warn!(
                event_name = "tool.call_out_of_scope",
                tool = name,
                scope = ?scope,
                room_id = %auth.room_id,
                "model requested a tool outside its scope"
            );
            self.record(auth, name, AuditOutcome::Rejected, "out_of_scope");
            return ToolCallResult::error(format!("tool `{name}` is not available at this step"));
        }
        self.call_tool(name, args, auth).await
    }

    pub async fn call_tool_for_step(
        &self,
        step: SpaceStep,
        name: &str,
        args: Value,
        auth: &AuthContext,
    ) -> ToolCallResult {
        self.call_tool_in_scope(&ToolScope::Step(step), name, args, auth).await
    }

    /// Never fails: unknown tools, guardrail refusals and handler errors all
    /// come back as `is_error` results the model can read.
    pub async fn call_tool(&self, name: &str, args: Value, auth: &AuthContext) -> ToolCallResult {
        let Some(tool) = self.tools.get(name).cloned() else {
            self.record(auth, name, AuditOutcome::Rejected, "unknown_tool");
            return ToolCallResult::error(format!("unknown tool `{name}`"));
        };

        let descriptor = tool.descriptor();
        let intent = GuardrailIntent::ToolCall { tool: descriptor.name.clone(), access: descriptor.access };
        match self.guardrails.evaluate(&intent, auth) {
            GuardrailDecision::Allow => {}
            GuardrailDecision::Deny { reason_code, user_message, fallback_path }
            | GuardrailDecision::Degrade { reason_code, user_message, fallback_path } => {
                warn!(
                    event_name = "tool.call_refused",
                    action = %intent.action_key(),
                    reason_code,
                    fallback_path,
                    room_id = %auth.room_id,
                    "guardrail refused tool call"
                );
                self.record(auth, name, AuditOutcome::Rejected, reason_code);
                return ToolCallResult::error(user_message);
            }
        }

        match tool.execute(args, auth).await {
            Ok(result) => {
                debug!(
                    event_name = "tool.call_completed",
                    tool = name,
                    is_error = result.is_error,
                    room_id = %auth.room_id,
                    "tool call completed"
                );
                let outcome = if result.is_error { AuditOutcome::Failed } else { AuditOutcome::Success };
                self.record(auth, name, outcome, "completed");
                result
            }
            Err(error) => {
                warn!(
                    event_name = "tool.call_failed",
                    tool = name,
                    room_id = %auth.room_id,
                    error = %error,
                    "tool call failed"
                );
                self.record(auth, name, AuditOutcome::Failed, "handler_error");
                ToolCallResult::error(error.to_string())
            }
        }
    }

    fn record(&self, auth: &AuthContext, tool: &str, outcome: AuditOutcome, detail: &str) {
        self.audit.emit(
            AuditEvent::new(
                Some(auth.room_id.clone()),
                self.get_or_create_session(&auth.room_id),
                "tool.call",
                AuditCategory::Tool,
                auth.external_user_id.clone(),
                outcome,
            )
            .with_metadata("tool", tool)
            .with_metadata("detail", detail),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use concierge_core::audit::{AuditOutcome, InMemoryAuditSink};
    use concierge_core::flows::SpaceStep;
    use concierge_core::{AuthContext, LocalUser, RoomId, WorkflowType};
    use serde_json::{json, Value};

    use super::{
        ToolAccess, ToolCallResult, ToolDescriptor, ToolError, ToolInvocationBridge, ToolScope,
        Tool,
    };
    use crate::guardrails::GuardrailPolicy;

    struct StaticTool {
        descriptor: ToolDescriptor,
        outcome: Result<ToolCallResult, ToolError>,
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn descriptor(&self) -> ToolDescriptor {
            self.descriptor.clone()
        }

        async fn execute(&self, _input: Value, _auth: &AuthContext) -> Result<ToolCallResult, ToolError> {
            self.outcome.clone()
        }
    }

    fn bridge(sink: &InMemoryAuditSink) -> ToolInvocationBridge {
        let mut bridge = ToolInvocationBridge::new(GuardrailPolicy::default(), Arc::new(sink.clone()));
        bridge.register(StaticTool {
            descriptor: ToolDescriptor::new("list_spaces", "List spaces", json!({}))
                .for_reservation_steps(),
            outcome: Ok(ToolCallResult::text("parking-1")),
        });
        bridge.register(StaticTool {
            descriptor: ToolDescriptor::new("create_reservation", "Create", json!({}))
                .for_reservation_steps()
                .mutating(),
            outcome: Err(ToolError::Backend("database locked".to_owned())),
        });
        bridge.register(StaticTool {
            descriptor: ToolDescriptor::new("get_infos", "Infos", json!({}))
                .for_workflows([WorkflowType::General]),
            outcome: Ok(ToolCallResult::text("infos")),
        });
        bridge
    }

    fn auth(room: &str, user: bool) -> AuthContext {
        AuthContext::new(
            "@bob:neohoods.com",
            RoomId::new(room),
            true,
            user.then(|| LocalUser::new("u-2", "Bob")),
        )
    }

    #[test]
    fn step_visibility_follows_the_reservation_whitelist() {
        let bridge = bridge(&InMemoryAuditSink::default());
        let names = |step| {
            bridge.tools_for_step(step).into_iter().map(|tool| tool.name).collect::<Vec<_>>()
        };

        assert_eq!(names(SpaceStep::RequestSpaceInfo), vec!["list_spaces".to_owned()]);
        assert!(names(SpaceStep::CompleteReservation).contains(&"create_reservation".to_owned()));
        assert!(!names(SpaceStep::CompleteReservation).contains(&"get_infos".to_owned()));
        assert_eq!(bridge.tools_in_scope(&ToolScope::Workflow(WorkflowType::General)).len(), 1);
        assert_eq!(bridge.list_tools().len(), 3);
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_result() {
        let sink = InMemoryAuditSink::default();
        let bridge = bridge(&sink);

        let result = bridge.call_tool("create_reservation", json!({}), &auth("!a", true)).await;

        assert!(result.is_error);
        assert!(result.to_model_string().contains("database locked"));
        assert_eq!(sink.events()[0].outcome, AuditOutcome::Failed);
    }

    #[tokio::test]
    async fn mutating_tool_fails_closed_without_user() {
        let bridge = bridge(&InMemoryAuditSink::default());
        let result = bridge.call_tool("create_reservation", json!({}), &auth("!a", false)).await;

        assert!(result.is_error);
        assert!(result.to_model_string().contains("compte du portail"));
    }

    #[tokio::test]
    async fn out_of_scope_and_unknown_tools_are_refused() {
        let bridge = bridge(&InMemoryAuditSink::default());
        let auth = auth("!a", true);

        let result = bridge
            .call_tool_for_step(SpaceStep::RequestSpaceInfo, "create_reservation", json!({}), &auth)
            .await;
        assert!(result.is_error);
        assert!(result.to_model_string().contains("not available"));

        let result = bridge.call_tool("launch_rocket", json!({}), &auth).await;
        assert!(result.is_error);

        let result = bridge
            .call_tool_for_step(SpaceStep::RequestSpaceInfo, "list_spaces", json!({}), &auth)
            .await;
        assert_eq!(result, ToolCallResult::text("parking-1"));
    }

    #[test]
    fn session_tokens_are_stable_per_room_and_distinct_across_rooms() {
        let bridge = ToolInvocationBridge::default();
        let first = bridge.get_or_create_session(&RoomId::new("!a"));
        let again = bridge.get_or_create_session(&RoomId::new("!a"));
        let other = bridge.get_or_create_session(&RoomId::new("!b"));

        assert_eq!(first, again);
        assert_ne!(first, other);

        assert!(bridge.forget_session(&RoomId::new("!a")));
        assert_ne!(bridge.get_or_create_session(&RoomId::new("!a")), first);
        assert_eq!(bridge.clear_sessions(), 2);
        assert_eq!(bridge.session_count(), 0);
    }

    #[test]
    fn descriptor_defaults_are_read_only_and_always_visible() {
        let descriptor = ToolDescriptor::new("ping", "Ping", json!({}));
        assert_eq!(descriptor.access, ToolAccess::ReadOnly);
        assert!(descriptor.is_visible_in(&ToolScope::Step(SpaceStep::PaymentInstructions)));
        assert!(descriptor.is_visible_in(&ToolScope::Workflow(WorkflowType::Help)));
    }
}
