use std::sync::Arc;

use chrono::Duration;
use concierge_core::audit::{AuditSink, NoopAuditSink};
use concierge_core::config::{AppConfig, AssistantConfig};
use concierge_core::{ApplicationError, AuthContext, InterfaceError, WorkflowType};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agents::{GeneralAgent, TurnRunner};
use crate::catalog::register_portal_tools;
use crate::clock::{Clock, SystemClock};
use crate::context::AgentContextStore;
use crate::conversation::HistoryWindow;
use crate::guardrails::GuardrailPolicy;
use crate::http::ProviderClient;
use crate::llm::{ConversationApi, HistoryMessage, WorkflowClassifier};
use crate::portal::PortalBackend;
use crate::prompts::PromptLibrary;
use crate::reservation::SpaceAgent;
use crate::router::{Router, RouterSettings};
use crate::session::ConversationSessionManager;
use crate::tools::ToolInvocationBridge;

/// Capabilities the runtime is assembled from. Production wires the HTTP
/// provider client; tests wire the scripted fixtures.
pub struct RuntimeParts {
    pub conversations: Arc<dyn ConversationApi>,
    pub classifier: Arc<dyn WorkflowClassifier>,
    pub portal: Arc<dyn PortalBackend>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

impl RuntimeParts {
    pub fn new(
        conversations: Arc<dyn ConversationApi>,
        classifier: Arc<dyn WorkflowClassifier>,
        portal: Arc<dyn PortalBackend>,
    ) -> Self {
        Self {
            conversations,
            classifier,
            portal,
            audit: Arc::new(NoopAuditSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct AgentRuntime {
    router: Router,
    contexts: Arc<AgentContextStore>,
    sessions: Arc<ConversationSessionManager>,
    tools: Arc<ToolInvocationBridge>,
    sweep_interval: std::time::Duration,
}

impl AgentRuntime {
    /// Builds the runtime against the configured LLM provider.
    pub fn from_config(
        config: &AppConfig,
        portal: Arc<dyn PortalBackend>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ApplicationError> {
        let provider = Arc::new(ProviderClient::from_config(&config.llm)?);
        let parts = RuntimeParts::new(provider.clone(), provider, portal).with_audit(audit);
        Self::assemble(&config.assistant, config.llm.classification_temperature, parts)
    }

    pub fn assemble(
        config: &AssistantConfig,
        classification_temperature: f32,
        parts: RuntimeParts,
    ) -> Result<Self, ApplicationError> {
        let RuntimeParts { conversations, classifier, portal, audit, clock } = parts;
        let prompts = Arc::new(PromptLibrary::builtin()?);

        let guardrails = GuardrailPolicy {
            mutating_tools_enabled: config.mutating_tools_enabled,
            require_direct_message_for_space: config.require_direct_message_for_space,
        };
        let mut bridge = ToolInvocationBridge::new(guardrails.clone(), audit.clone());
        register_portal_tools(&mut bridge, portal);
        let tools = Arc::new(bridge);

        let expiration = minutes(config.conversation_expiration_minutes, "conversation_expiration_minutes")?;
        let sessions = Arc::new(
            ConversationSessionManager::with_clock(conversations, expiration, clock.clone())
                .with_store_default(config.store_conversations),
        );
        let contexts = Arc::new(AgentContextStore::new(clock.clone()));
        let runner = Arc::new(TurnRunner::new(sessions.clone(), tools.clone(), config.max_tool_rounds));

        let settings = RouterSettings {
            history_window: HistoryWindow::new(
                config.history_window_messages,
                minutes(config.history_window_minutes, "history_window_minutes")?,
            ),
            short_followup_max_chars: config.short_followup_max_chars,
            classification_temperature,
        };
        let mut router = Router::new(classifier, contexts.clone(), tools.clone(), prompts.clone(), clock.clone())
            .with_guardrails(guardrails)
            .with_audit(audit.clone())
            .with_settings(settings);

        for workflow in [
            WorkflowType::General,
            WorkflowType::ResidentInfo,
            WorkflowType::Help,
            WorkflowType::Support,
        ] {
            router.register(Arc::new(GeneralAgent::new(
                workflow,
                config.agent_for(workflow),
                runner.clone(),
                prompts.clone(),
                clock.clone(),
            )));
        }
        router.register(Arc::new(SpaceAgent::new(
            config.agent_for(WorkflowType::Space),
            runner,
            prompts,
            contexts.clone(),
            audit,
            clock,
        )));

        info!(
            event_name = "runtime.assembled",
            handlers = router.handler_count(),
            tools = tools.len(),
            "agent runtime ready"
        );

        Ok(Self { router, contexts, sessions, tools, sweep_interval: config.sweep_interval() })
    }

    pub async fn handle_message(
        &self,
        message: &str,
        history: &[HistoryMessage],
        auth: &AuthContext,
    ) -> Result<String, InterfaceError> {
        self.router.handle_message(message, history, auth).await
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn contexts(&self) -> &Arc<AgentContextStore> {
        &self.contexts
    }

    pub fn sessions(&self) -> &Arc<ConversationSessionManager> {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolInvocationBridge> {
        &self.tools
    }

    /// Drops every room context, and the rooms' correlation tokens, when the
    /// development reset flag is set.
    pub fn purge_on_startup(&self, dev_reset: bool) -> usize {
        let purged = self.contexts.purge_on_startup(dev_reset);
        if dev_reset {
            self.tools.clear_sessions();
        }
        purged
    }

    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.sessions.clone().spawn_sweeper(self.sweep_interval, cancel)
    }
}

fn minutes(value: u64, field: &str) -> Result<Duration, ApplicationError> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_minutes)
        .ok_or_else(|| ApplicationError::Configuration(format!("{field} is out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use concierge_core::config::{AppConfig, AssistantConfig};
    use concierge_core::{AuthContext, LocalUser, RoomId};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::{minutes, AgentRuntime, RuntimeParts};
    use crate::fixtures::{message, ScriptedConversation, StaticClassifier};
    use crate::portal::InMemoryPortal;

    fn runtime(conversation: Arc<ScriptedConversation>) -> AgentRuntime {
        runtime_with(conversation, &AppConfig::default().assistant)
    }

    fn runtime_with(conversation: Arc<ScriptedConversation>, config: &AssistantConfig) -> AgentRuntime {
        let parts = RuntimeParts::new(
            conversation,
            Arc::new(StaticClassifier::routing_to(concierge_core::WorkflowType::General)),
            Arc::new(InMemoryPortal::seeded()),
        );
        AgentRuntime::assemble(config, 0.1, parts).expect("runtime")
    }

    fn alice() -> AuthContext {
        AuthContext::new("@alice:neohoods.com", RoomId::new("!room"), true, Some(LocalUser::new("u-1", "Alice")))
    }

    #[tokio::test]
    async fn assembles_every_workflow_handler_and_portal_tool() {
        let runtime = runtime(Arc::new(ScriptedConversation::default()));

        assert_eq!(runtime.router().handler_count(), 5);
        assert_eq!(runtime.tools().len(), 10);
        assert!(runtime.contexts().is_empty());
    }

    #[tokio::test]
    async fn general_message_starts_a_conversation_for_the_room() {
        let conversation = Arc::new(ScriptedConversation::new([vec![message("Bonjour Alice !")]]));
        let runtime = runtime(conversation.clone());
        let auth = AuthContext::new(
            "@alice:neohoods.com",
            RoomId::new("!room"),
            true,
            Some(LocalUser::new("u-1", "Alice")),
        );

        let reply = runtime.handle_message("Bonjour, comment ça va ?", &[], &auth).await.expect("reply");

        assert_eq!(reply, "Bonjour Alice !");
        assert!(runtime.sessions().has_active_conversation(&auth.room_id));
        assert_eq!(conversation.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_mutating_tools_degrade_to_the_portal() {
        let mut config = AppConfig::default().assistant;
        config.mutating_tools_enabled = false;
        let runtime = runtime_with(Arc::new(ScriptedConversation::default()), &config);

        let result = runtime
            .tools()
            .call_tool("create_reservation", json!({"spaceId": "parking-12"}), &alice())
            .await;

        assert!(result.is_error);
        assert!(result.to_model_string().contains("temporairement indisponibles"));
    }

    #[tokio::test]
    async fn dev_purge_also_drops_correlation_tokens() {
        let conversation = Arc::new(ScriptedConversation::new([vec![message("Bonjour Alice !")]]));
        let runtime = runtime(conversation);
        runtime.handle_message("Bonjour, comment ça va ?", &[], &alice()).await.expect("reply");
        assert_eq!(runtime.tools().session_count(), 1);

        assert_eq!(runtime.purge_on_startup(false), 0);
        assert_eq!(runtime.tools().session_count(), 1);
        assert_eq!(runtime.purge_on_startup(true), 1);
        assert_eq!(runtime.tools().session_count(), 0);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancellation() {
        let runtime = runtime(Arc::new(ScriptedConversation::default()));
        let cancel = CancellationToken::new();
        let handle = runtime.spawn_sweeper(cancel.clone());

        cancel.cancel();
        handle.await.expect("sweeper joins");
    }

    #[test]
    fn oversized_minutes_are_a_configuration_error() {
        assert!(minutes(u64::MAX, "history_window_minutes").is_err());
        assert_eq!(minutes(10, "x").expect("minutes").num_minutes(), 10);
    }
}
