use std::collections::HashMap;
use std::sync::Arc;

use concierge_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink};
use concierge_core::{ApplicationError, AuthContext, InterfaceError, WorkflowType};
use tracing::{info, info_span, warn, Instrument};

use crate::agents::{HandlerTurn, WorkflowHandler};
use crate::clock::Clock;
use crate::context::AgentContextStore;
use crate::conversation::{is_short_followup, mentions_reservation, parse_route_decision, HistoryWindow};
use crate::guardrails::{GuardrailDecision, GuardrailIntent, GuardrailPolicy};
use crate::llm::{route_to_workflow_tool, ClassificationRequest, HistoryMessage, WorkflowClassifier};
use crate::prompts::PromptLibrary;
use crate::tools::ToolInvocationBridge;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RouterSettings {
    pub history_window: HistoryWindow,
    pub short_followup_max_chars: usize,
    pub classification_temperature: f32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            history_window: HistoryWindow::default(),
            short_followup_max_chars: 18,
            classification_temperature: 0.1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RouteSource {
    Followup,
    Classifier,
    Fallback,
}

impl RouteSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Followup => "followup",
            Self::Classifier => "classifier",
            Self::Fallback => "fallback",
        }
    }
}

/// Entry point for every inbound chat message: picks a workflow and hands the
/// message to the registered handler.
pub struct Router {
    classifier: Arc<dyn WorkflowClassifier>,
    contexts: Arc<AgentContextStore>,
    tools: Arc<ToolInvocationBridge>,
    prompts: Arc<PromptLibrary>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<WorkflowType, Arc<dyn WorkflowHandler>>,
    guardrails: GuardrailPolicy,
    audit: Arc<dyn AuditSink>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        classifier: Arc<dyn WorkflowClassifier>,
        contexts: Arc<AgentContextStore>,
        tools: Arc<ToolInvocationBridge>,
        prompts: Arc<PromptLibrary>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            classifier,
            contexts,
            tools,
            prompts,
            clock,
            handlers: HashMap::new(),
            guardrails: GuardrailPolicy::default(),
            audit: Arc::new(NoopAuditSink),
            settings: RouterSettings::default(),
        }
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailPolicy) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn register(&mut self, handler: Arc<dyn WorkflowHandler>) {
        self.handlers.insert(handler.workflow(), handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Answers one chat message. Only an unresolved portal user surfaces as an
    /// error; every other failure becomes a localized reply.
    pub async fn handle_message(
        &self,
        message: &str,
        history: &[HistoryMessage],
        auth: &AuthContext,
    ) -> Result<String, InterfaceError> {
        let correlation_id = self.tools.get_or_create_session(&auth.room_id);
        let span = info_span!("router.turn", room_id = %auth.room_id, correlation_id = %correlation_id);
        let reply = self.route(message, history, auth, &correlation_id).instrument(span).await;
        // Correlation tokens live exactly as long as the room context.
        if !self.contexts.contains(&auth.room_id) {
            self.tools.forget_session(&auth.room_id);
        }
        reply
    }

    async fn route(
        &self,
        message: &str,
        history: &[HistoryMessage],
        auth: &AuthContext,
        correlation_id: &str,
    ) -> Result<String, InterfaceError> {
        if let Err(error) = auth.require_user() {
            warn!(event_name = "router.unauthorized", external_user_id = %auth.external_user_id, "no portal account");
            self.record(auth, correlation_id, "router.unauthorized", AuditOutcome::Rejected, None);
            return Err(ApplicationError::from(error).into_interface(correlation_id));
        }

        let message = message.trim();
        if message.is_empty() {
            let rephrase = InterfaceError::Rephrase {
                message: "empty message".to_owned(),
                correlation_id: correlation_id.to_owned(),
            };
            return Ok(rephrase.user_message().to_owned());
        }

        let now = self.clock.now();
        let window = self.settings.history_window.apply(history, now);
        let context = self.contexts.get(&auth.room_id);
        let previous = context.as_ref().and_then(|context| context.current_workflow);

        let recent_workflow = context.as_ref().and_then(|context| {
            let fresh = now - context.last_interaction_time <= self.settings.history_window.max_age;
            context.current_workflow.filter(|_| fresh)
        });
        let (mut workflow, source) = match recent_workflow {
            Some(workflow) if is_short_followup(message, self.settings.short_followup_max_chars) => {
                (workflow, RouteSource::Followup)
            }
            _ => self.classify(message, &window, previous).await,
        };

        if workflow != WorkflowType::Space && mentions_reservation(message) {
            info!(event_name = "router.heuristic_override", from = %workflow, "reservation keywords detected");
            workflow = WorkflowType::Space;
        }
        info!(
            event_name = "router.workflow_classified",
            workflow = %workflow,
            source = source.as_str(),
            "workflow selected"
        );

        let intent = GuardrailIntent::EnterWorkflow { workflow };
        match self.guardrails.evaluate(&intent, auth) {
            GuardrailDecision::Allow => {}
            GuardrailDecision::Deny { reason_code, user_message, fallback_path }
            | GuardrailDecision::Degrade { reason_code, user_message, fallback_path } => {
                info!(
                    event_name = "router.workflow_degraded",
                    action = %intent.action_key(),
                    reason_code,
                    fallback_path,
                    "guardrail redirected"
                );
                self.audit.emit(
                    self.event(auth, correlation_id, "router.workflow_degraded", AuditOutcome::Rejected, Some(workflow))
                        .with_metadata("reason_code", reason_code)
                        .with_metadata("fallback_path", fallback_path),
                );
                return Ok(user_message);
            }
        }

        let Some(handler) = self.handler_for(workflow) else {
            warn!(event_name = "router.no_handler", workflow = %workflow, "no handler registered");
            return Ok(ApplicationError::Configuration(format!("no handler for {workflow}"))
                .into_interface(correlation_id)
                .user_message()
                .to_owned());
        };

        self.contexts.set_workflow(&auth.room_id, Some(workflow));
        self.record(auth, correlation_id, "router.workflow_selected", AuditOutcome::Success, Some(workflow));

        let turn = HandlerTurn { message, history: &window, auth, correlation_id };
        match handler.handle(&turn).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                warn!(
                    event_name = "router.handler_failed",
                    workflow = %workflow,
                    error = %error,
                    "handler failed, restoring the room context"
                );
                self.contexts.restore(&auth.room_id, context);
                self.record(auth, correlation_id, "router.handler_failed", AuditOutcome::Failed, Some(workflow));
                let interface = error.into_interface(correlation_id);
                if matches!(interface, InterfaceError::Unauthorized { .. }) {
                    return Err(interface);
                }
                Ok(interface.user_message().to_owned())
            }
        }
    }

    async fn classify(
        &self,
        message: &str,
        window: &[HistoryMessage],
        current: Option<WorkflowType>,
    ) -> (WorkflowType, RouteSource) {
        let instructions = match self.prompts.router(current, &HistoryWindow::render(window)) {
            Ok(instructions) => instructions,
            Err(error) => {
                warn!(event_name = "router.prompt_failed", error = %error, "router prompt unavailable");
                return (WorkflowType::General, RouteSource::Fallback);
            }
        };
        let request = ClassificationRequest {
            message: message.to_owned(),
            history: window.to_vec(),
            current_workflow: current,
            instructions,
            temperature: self.settings.classification_temperature,
            tool: route_to_workflow_tool(),
        };

        match self.classifier.classify_workflow(&request).await {
            Ok(reply) => match parse_route_decision(&reply) {
                Some(workflow) => (workflow, RouteSource::Classifier),
                None => {
                    warn!(event_name = "router.classification_unreadable", "classifier reply had no workflow");
                    (WorkflowType::General, RouteSource::Fallback)
                }
            },
            Err(error) => {
                warn!(event_name = "router.classification_failed", error = %error, "falling back to GENERAL");
                (WorkflowType::General, RouteSource::Fallback)
            }
        }
    }

    fn handler_for(&self, workflow: WorkflowType) -> Option<Arc<dyn WorkflowHandler>> {
        self.handlers
            .get(&workflow)
            .or_else(|| match workflow {
                WorkflowType::Help | WorkflowType::Support => self.handlers.get(&WorkflowType::General),
                _ => None,
            })
            .cloned()
    }

    fn record(
        &self,
        auth: &AuthContext,
        correlation_id: &str,
        event_type: &str,
        outcome: AuditOutcome,
        workflow: Option<WorkflowType>,
    ) {
        self.audit.emit(self.event(auth, correlation_id, event_type, outcome, workflow));
    }

    fn event(
        &self,
        auth: &AuthContext,
        correlation_id: &str,
        event_type: &str,
        outcome: AuditOutcome,
        workflow: Option<WorkflowType>,
    ) -> AuditEvent {
        let mut event = AuditEvent::new(
            Some(auth.room_id.clone()),
            correlation_id,
            event_type,
            AuditCategory::Routing,
            auth.external_user_id.clone(),
            outcome,
        );
        if let Some(workflow) = workflow {
            event = event.with_metadata("workflow", workflow.as_str());
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use concierge_core::audit::InMemoryAuditSink;
    use concierge_core::{ApplicationError, AuthContext, InterfaceError, LocalUser, RoomId, WorkflowType};
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::Router;
    use crate::agents::{HandlerTurn, WorkflowHandler};
    use crate::clock::ManualClock;
    use crate::context::AgentContextStore;
    use crate::fixtures::StaticClassifier;
    use crate::llm::{ClassifierReply, HistoryMessage};
    use crate::prompts::PromptLibrary;
    use crate::tools::ToolInvocationBridge;

    struct RecordingHandler {
        workflow: WorkflowType,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn new(workflow: WorkflowType) -> Arc<Self> {
            Arc::new(Self { workflow, seen: Mutex::new(Vec::new()), fail: false })
        }

        fn failing(workflow: WorkflowType) -> Arc<Self> {
            Arc::new(Self { workflow, seen: Mutex::new(Vec::new()), fail: true })
        }
    }

    #[async_trait]
    impl WorkflowHandler for RecordingHandler {
        fn workflow(&self) -> WorkflowType {
            self.workflow
        }

        async fn handle(&self, turn: &HandlerTurn<'_>) -> Result<String, ApplicationError> {
            self.seen.lock().await.push(turn.message.to_owned());
            if self.fail {
                return Err(ApplicationError::Provider("upstream 502".to_owned()));
            }
            Ok(format!("{}:{}", self.workflow, turn.message))
        }
    }

    struct Setup {
        router: Router,
        classifier: Arc<StaticClassifier>,
        contexts: Arc<AgentContextStore>,
        tools: Arc<ToolInvocationBridge>,
        clock: Arc<ManualClock>,
        audit: InMemoryAuditSink,
    }

    fn setup(classifier: StaticClassifier, handlers: Vec<Arc<RecordingHandler>>) -> Setup {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).single().expect("valid instant"),
        ));
        let classifier = Arc::new(classifier);
        let contexts = Arc::new(AgentContextStore::new(clock.clone()));
        let audit = InMemoryAuditSink::default();
        let tools = Arc::new(ToolInvocationBridge::default());
        let mut router = Router::new(
            classifier.clone(),
            contexts.clone(),
            tools.clone(),
            Arc::new(PromptLibrary::builtin().expect("templates")),
            clock.clone(),
        )
        .with_audit(Arc::new(audit.clone()));
        for handler in handlers {
            router.register(handler);
        }
        Setup { router, classifier, contexts, tools, clock, audit }
    }

    fn resident(direct: bool) -> AuthContext {
        AuthContext::new("@alice:neohoods.com", RoomId::new("!room"), direct, Some(LocalUser::new("u-1", "Alice")))
    }

    #[tokio::test]
    async fn unresolved_user_is_rejected_before_any_classification() {
        let setup = setup(StaticClassifier::routing_to(WorkflowType::General), vec![RecordingHandler::new(WorkflowType::General)]);
        let auth = AuthContext::new("@ghost:neohoods.com", RoomId::new("!room"), true, None);

        let error = setup.router.handle_message("bonjour", &[], &auth).await.expect_err("unauthorized");

        assert!(matches!(error, InterfaceError::Unauthorized { .. }));
        assert!(setup.classifier.requests().await.is_empty());
    }

    #[tokio::test]
    async fn blank_and_garbage_messages_get_a_non_empty_reply() {
        let general = RecordingHandler::new(WorkflowType::General);
        let setup = setup(StaticClassifier::failing("timeout"), vec![general.clone()]);

        let blank = setup.router.handle_message("   ", &[], &resident(true)).await.expect("reply");
        assert!(blank.contains("reformuler"));

        let garbage = setup.router.handle_message("qsdkjh ¤¤ 42 !!", &[], &resident(true)).await.expect("reply");
        assert_eq!(garbage, "GENERAL:qsdkjh ¤¤ 42 !!");
    }

    #[tokio::test]
    async fn reservation_keywords_override_the_classifier_and_need_a_direct_message() {
        let space = RecordingHandler::new(WorkflowType::Space);
        let general = RecordingHandler::new(WorkflowType::General);
        let setup = setup(StaticClassifier::routing_to(WorkflowType::General), vec![space.clone(), general]);

        let reply = setup.router.handle_message("Je voudrais réserver le parking", &[], &resident(true)).await.expect("reply");
        assert_eq!(reply, "SPACE:Je voudrais réserver le parking");

        let context = setup.contexts.get(&RoomId::new("!room")).expect("context");
        assert_eq!(context.current_workflow, Some(WorkflowType::Space));

        let group = setup.router.handle_message("réserver la salle commune", &[], &resident(false)).await.expect("reply");
        assert!(group.contains("message privé"));
        assert_eq!(space.seen.lock().await.len(), 1);
        let degraded = setup.audit.events_of_type("router.workflow_degraded");
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].metadata.get("fallback_path").map(String::as_str), Some("direct_message"));
    }

    #[tokio::test]
    async fn short_followup_reuses_a_recent_workflow_without_classifying() {
        let setup = setup(
            StaticClassifier::routing_to(WorkflowType::ResidentInfo),
            vec![RecordingHandler::new(WorkflowType::ResidentInfo), RecordingHandler::new(WorkflowType::General)],
        );
        let auth = resident(true);

        setup.router.handle_message("qui habite au B03 ?", &[], &auth).await.expect("reply");
        assert_eq!(setup.classifier.requests().await.len(), 1);

        setup.clock.advance(Duration::minutes(2));
        let reply = setup.router.handle_message("et au A12", &[], &auth).await.expect("reply");
        assert_eq!(reply, "RESIDENT_INFO:et au A12");
        assert_eq!(setup.classifier.requests().await.len(), 1);

        setup.clock.advance(Duration::minutes(30));
        setup.classifier.push(Ok(ClassifierReply { tool_arguments: Some(json!({"workflow": "GENERAL"})), content: None })).await;
        let reply = setup.router.handle_message("et au A12", &[], &auth).await.expect("reply");
        assert_eq!(reply, "GENERAL:et au A12");
    }

    #[tokio::test]
    async fn classifier_sees_a_trimmed_history_and_low_temperature() {
        let setup = setup(StaticClassifier::routing_to(WorkflowType::General), vec![RecordingHandler::new(WorkflowType::General)]);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).single().expect("valid instant");
        let history = (0..14)
            .map(|index| HistoryMessage::user(format!("m{index}"), now - Duration::minutes(14 - index)))
            .collect::<Vec<_>>();

        setup.router.handle_message("bonjour tout le monde", &history, &resident(true)).await.expect("reply");

        let requests = setup.classifier.requests().await;
        assert_eq!(requests[0].history.len(), 10);
        assert_eq!(requests[0].history[9].content, "m13");
        assert!((requests[0].temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(requests[0].tool.name, "route_to_workflow");
    }

    #[tokio::test]
    async fn handler_failure_restores_the_previous_context() {
        let setup = setup(
            StaticClassifier::routing_to(WorkflowType::Support),
            vec![RecordingHandler::new(WorkflowType::General), RecordingHandler::failing(WorkflowType::Support)],
        );
        let auth = resident(true);
        setup.contexts.set_workflow(&auth.room_id, Some(WorkflowType::General));
        setup.contexts.update_state_key(&auth.room_id, "note", json!("kept"));
        let before = setup.contexts.get(&auth.room_id);
        setup.clock.advance(Duration::hours(1));

        let reply = setup.router.handle_message("mon badge ne marche plus", &[], &auth).await.expect("reply");

        assert!(reply.contains("problème technique"));
        let context = setup.contexts.get(&auth.room_id).expect("context");
        assert_eq!(context.current_workflow, Some(WorkflowType::General));
        assert_eq!(context.workflow_state.get("note"), Some(&json!("kept")));
        assert_eq!(Some(context), before);
    }

    #[tokio::test]
    async fn failed_first_turn_leaves_no_context_or_token_behind() {
        let setup = setup(
            StaticClassifier::routing_to(WorkflowType::Support),
            vec![RecordingHandler::failing(WorkflowType::Support)],
        );
        let auth = resident(true);

        let reply = setup.router.handle_message("mon badge ne marche plus", &[], &auth).await.expect("reply");

        assert!(reply.contains("problème technique"));
        assert!(!setup.contexts.contains(&auth.room_id));
        assert_eq!(setup.tools.session_count(), 0);
    }

    #[tokio::test]
    async fn correlation_token_follows_the_room_context() {
        let setup = setup(StaticClassifier::routing_to(WorkflowType::General), vec![RecordingHandler::new(WorkflowType::General)]);
        let ghost = AuthContext::new("@ghost:neohoods.com", RoomId::new("!ghost"), true, None);

        setup.router.handle_message("bonjour", &[], &ghost).await.expect_err("unauthorized");
        assert_eq!(setup.tools.session_count(), 0);

        let auth = resident(true);
        setup.router.handle_message("bonjour", &[], &auth).await.expect("reply");
        let token = setup.tools.get_or_create_session(&auth.room_id);
        setup.router.handle_message("merci beaucoup pour tout", &[], &auth).await.expect("reply");
        assert_eq!(setup.tools.get_or_create_session(&auth.room_id), token);
        assert_eq!(setup.tools.session_count(), 1);
    }

    #[tokio::test]
    async fn help_falls_back_to_the_general_handler() {
        let general = RecordingHandler::new(WorkflowType::General);
        let setup = setup(StaticClassifier::routing_to(WorkflowType::Help), vec![general.clone()]);

        let reply = setup.router.handle_message("que sais-tu faire ?", &[], &resident(true)).await.expect("reply");

        assert_eq!(reply, "GENERAL:que sais-tu faire ?");
        assert_eq!(setup.router.handler_count(), 1);
    }
}
