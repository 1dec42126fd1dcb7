use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::audit::{AuditContext, AuditSink};
use concierge_core::flows::engine::SUBMIT_RESERVATION_STEP;
use concierge_core::flows::{
    FlowEngine, SpaceReservationFlow, StepDisposition, StepResult, TransitionOutcome,
};
use concierge_core::{AgentId, ApplicationError, WorkflowType};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agents::{HandlerTurn, TurnOutcome, TurnRequest, TurnRunner, WorkflowHandler};
use crate::clock::Clock;
use crate::context::{
    AgentContextStore, AVAILABLE_SPACES_KEY, PERIOD_KEY, RESERVATION_STEP_KEY, SPACE_ID_KEY,
};
use crate::conversation::{selected_number, strip_code_fences};
use crate::prompts::{PromptLibrary, SpaceStepPrompt};
use crate::tools::ToolScope;

const FALLBACK_RESPONSE: &str =
    "Je n'ai pas bien compris votre demande de réservation. Pouvez-vous préciser l'espace et les dates souhaités ?";

/// Space reservation agent. Each turn runs inside the current step's tool
/// whitelist and moves the step machine with the model's `StepResult`.
pub struct SpaceAgent {
    agent_id: AgentId,
    runner: Arc<TurnRunner>,
    prompts: Arc<PromptLibrary>,
    contexts: Arc<AgentContextStore>,
    engine: FlowEngine<SpaceReservationFlow>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl SpaceAgent {
    pub fn new(
        agent_id: AgentId,
        runner: Arc<TurnRunner>,
        prompts: Arc<PromptLibrary>,
        contexts: Arc<AgentContextStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { agent_id, runner, prompts, contexts, engine: FlowEngine::default(), audit, clock }
    }

    fn persist(&self, turn: &HandlerTurn<'_>, result: &StepResult, transition: Option<&TransitionOutcome>) {
        let room_id = turn.room_id();
        if transition.is_some_and(|outcome| outcome.disposition == StepDisposition::ClearWorkflow) {
            self.contexts.clear(room_id);
            self.runner.sessions().clear_conversation(room_id);
            info!(
                event_name = "flow.workflow_cleared",
                room_id = %room_id,
                correlation_id = turn.correlation_id,
                status = ?result.status,
                "reservation workflow finished"
            );
            return;
        }

        let next_step = transition.and_then(|outcome| outcome.to);
        self.contexts.update_state(room_id, |state| {
            if let Some(step) = next_step {
                state.insert(RESERVATION_STEP_KEY.to_owned(), json!(step.as_str()));
            }
            if let Some(space_id) = result.space_id.as_deref().filter(|id| !id.trim().is_empty()) {
                state.insert(SPACE_ID_KEY.to_owned(), json!(space_id));
            }
            if let Some(period) = result.period.as_ref().filter(|period| period.is_complete()) {
                state.insert(PERIOD_KEY.to_owned(), json!(period));
            }
            if !result.available_spaces.is_empty() {
                state.insert(AVAILABLE_SPACES_KEY.to_owned(), json!(result.available_spaces));
            }
        });
    }
}

#[async_trait]
impl WorkflowHandler for SpaceAgent {
    fn workflow(&self) -> WorkflowType {
        WorkflowType::Space
    }

    async fn handle(&self, turn: &HandlerTurn<'_>) -> Result<String, ApplicationError> {
        let room_id = turn.room_id();
        let context = self.contexts.get_or_create(room_id);
        let step = context.reservation_step();
        let flow_context = context.flow_context();

        let selected = selected_number(turn.message)
            .and_then(|number| context.offered_space(number).map(|space_id| (number, space_id)));
        let prompt = SpaceStepPrompt {
            step,
            space_id: flow_context.space_id.clone(),
            period: flow_context.period.clone(),
            selected_number: selected.as_ref().map(|(number, _)| *number),
            selected_space: selected.as_ref().map(|(_, space_id)| space_id.clone()),
        };
        let instructions =
            self.prompts.space_step(&prompt, turn.auth.user.as_ref(), self.clock.now().date_naive())?;

        let outcome = self
            .runner
            .run(TurnRequest {
                agent_id: &self.agent_id,
                message: turn.message,
                instructions: Some(instructions),
                scope: ToolScope::Step(step),
                auth: turn.auth,
                intercept: Some(SUBMIT_RESERVATION_STEP),
            })
            .await?;

        let mut result = interpret_step_output(&outcome);
        if result.space_id.is_none() {
            result.space_id = prompt.selected_space;
        }

        let audit = AuditContext::new(
            Some(room_id.clone()),
            turn.correlation_id,
            turn.auth.external_user_id.clone(),
        );
        match self.engine.apply_with_audit(step, &result, &flow_context, self.audit.as_ref(), &audit) {
            Ok(transition) => {
                info!(
                    event_name = "flow.step_applied",
                    room_id = %room_id,
                    correlation_id = turn.correlation_id,
                    from = %transition.from,
                    to = transition.to.map_or("CLEARED", |step| step.as_str()),
                    "reservation step applied"
                );
                self.persist(turn, &result, Some(&transition));
            }
            Err(error) => {
                warn!(
                    event_name = "flow.transition_anomaly",
                    room_id = %room_id,
                    correlation_id = turn.correlation_id,
                    step = %step,
                    error = %error,
                    "model proposed an invalid transition, staying on current step"
                );
                self.persist(turn, &result, None);
            }
        }

        Ok(response_text(&result, &outcome))
    }
}

/// Step result from, in order: the intercepted structured call, a JSON object
/// in the answer, or the plain answer treated as PENDING.
pub fn interpret_step_output(outcome: &TurnOutcome) -> StepResult {
    if let Some(result) =
        outcome.intercepted.clone().and_then(|arguments| serde_json::from_value::<StepResult>(arguments).ok())
    {
        return result;
    }
    if let Some(result) = json_step_result(&outcome.text) {
        return result;
    }
    StepResult::pending(outcome.text.trim())
}

fn json_step_result(text: &str) -> Option<StepResult> {
    let stripped = strip_code_fences(text);
    if let Ok(result) = serde_json::from_str::<StepResult>(stripped) {
        return Some(result);
    }
    // Prose followed by a trailing object.
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let candidate = text.get(start..=end)?;
    serde_json::from_str::<Value>(candidate).ok().and_then(|value| serde_json::from_value(value).ok())
}

fn response_text(result: &StepResult, outcome: &TurnOutcome) -> String {
    if !result.response.trim().is_empty() {
        return result.response.trim().to_owned();
    }
    let prose = match outcome.text.find('{') {
        Some(start) => outcome.text[..start].trim(),
        None => outcome.text.trim(),
    };
    if prose.is_empty() {
        FALLBACK_RESPONSE.to_owned()
    } else {
        prose.to_owned()
    }
}
