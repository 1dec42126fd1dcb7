use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::workflow::WorkflowType;
use crate::flows::states::{
    FlowContext, SpaceStep, StepDisposition, StepResult, StepStatus, TransitionOutcome,
};

pub const LIST_SPACES: &str = "list_spaces";
pub const GET_SPACE_INFO: &str = "get_space_info";
pub const CHECK_SPACE_AVAILABILITY: &str = "check_space_availability";
pub const SUBMIT_RESERVATION_STEP: &str = "submit_reservation_step";
pub const CREATE_RESERVATION: &str = "create_reservation";
pub const GENERATE_PAYMENT_LINK: &str = "generate_payment_link";

const DISCOVERY_TOOLS: [&str; 3] = [LIST_SPACES, GET_SPACE_INFO, CHECK_SPACE_AVAILABILITY];

pub trait FlowDefinition {
    fn flow_type(&self) -> WorkflowType;
    fn initial_step(&self) -> SpaceStep;
    fn allowed_targets(&self, step: SpaceStep) -> &'static [SpaceStep];
    fn tool_whitelist(&self, step: SpaceStep) -> Vec<&'static str>;
    fn transition(
        &self,
        current: SpaceStep,
        result: &StepResult,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

#[derive(Clone, Debug, Default)]
pub struct SpaceReservationFlow;

impl SpaceReservationFlow {
    /// Where a COMPLETED status leads. `None` means the workflow is done.
    pub fn completion_target(step: SpaceStep) -> Option<SpaceStep> {
        use SpaceStep::*;
        match step {
            RequestSpaceInfo => Some(ChooseSpace),
            ChooseSpace => Some(ConfirmReservationSummary),
            ConfirmReservationSummary => Some(CompleteReservation),
            CompleteReservation => Some(PaymentInstructions),
            PaymentInstructions => None,
        }
    }
}

impl FlowDefinition for SpaceReservationFlow {
    fn flow_type(&self) -> WorkflowType {
        WorkflowType::Space
    }

    fn initial_step(&self) -> SpaceStep {
        SpaceStep::RequestSpaceInfo
    }

    fn allowed_targets(&self, step: SpaceStep) -> &'static [SpaceStep] {
        use SpaceStep::*;
        match step {
            RequestSpaceInfo => &[ChooseSpace],
            ChooseSpace => &[ConfirmReservationSummary, CompleteReservation],
            ConfirmReservationSummary => &[CompleteReservation],
            CompleteReservation => &[PaymentInstructions],
            PaymentInstructions => &[],
        }
    }

    fn tool_whitelist(&self, step: SpaceStep) -> Vec<&'static str> {
        let mut tools = DISCOVERY_TOOLS.to_vec();
        match step {
            SpaceStep::RequestSpaceInfo => {}
            SpaceStep::ChooseSpace => tools.push(SUBMIT_RESERVATION_STEP),
            SpaceStep::ConfirmReservationSummary | SpaceStep::CompleteReservation => {
                tools.extend([CREATE_RESERVATION, GENERATE_PAYMENT_LINK]);
            }
            SpaceStep::PaymentInstructions => tools.push(GENERATE_PAYMENT_LINK),
        }
        tools
    }

    fn transition(
        &self,
        current: SpaceStep,
        result: &StepResult,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        let stay = |status| TransitionOutcome {
            from: current,
            to: Some(current),
            status,
            disposition: StepDisposition::Stay,
        };

        let target = match result.status {
            StepStatus::Pending | StepStatus::AskUser => return Ok(stay(result.status)),
            StepStatus::Canceled => {
                return Ok(TransitionOutcome {
                    from: current,
                    to: None,
                    status: result.status,
                    disposition: StepDisposition::ClearWorkflow,
                });
            }
            StepStatus::SwitchStep => {
                let raw = result
                    .next_step
                    .as_deref()
                    .ok_or(FlowTransitionError::MissingNextStep { from: current })?;
                let target = raw.parse::<SpaceStep>()?;
                if !self.allowed_targets(current).contains(&target) {
                    return Err(FlowTransitionError::InvalidTransition { from: current, to: target });
                }
                target
            }
            StepStatus::Completed => match Self::completion_target(current) {
                Some(target) => target,
                None => {
                    return Ok(TransitionOutcome {
                        from: current,
                        to: None,
                        status: result.status,
                        disposition: StepDisposition::ClearWorkflow,
                    });
                }
            },
        };

        if target.requires_reservation_data() {
            let missing_fields = context.merged_with(result).missing_reservation_fields();
            if !missing_fields.is_empty() {
                return Err(FlowTransitionError::MissingReservationData {
                    target,
                    missing_fields,
                });
            }
        }

        Ok(TransitionOutcome {
            from: current,
            to: Some(target),
            status: result.status,
            disposition: StepDisposition::Advance,
        })
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn flow_type(&self) -> WorkflowType {
        self.flow.flow_type()
    }

    pub fn initial_step(&self) -> SpaceStep {
        self.flow.initial_step()
    }

    pub fn tool_whitelist(&self, step: SpaceStep) -> Vec<&'static str> {
        self.flow.tool_whitelist(step)
    }

    pub fn allowed_targets(&self, step: SpaceStep) -> &'static [SpaceStep] {
        self.flow.allowed_targets(step)
    }

    pub fn apply(
        &self,
        current: SpaceStep,
        result: &StepResult,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, result, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: SpaceStep,
        result: &StepResult,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let outcome = self.apply(current, result, context);
        match &outcome {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.room_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_applied",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.map_or("CLEARED", |step| step.as_str()))
                    .with_metadata("status", format!("{:?}", outcome.status)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.room_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_rejected",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("from", current.as_str())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        outcome
    }
}

impl Default for FlowEngine<SpaceReservationFlow> {
    fn default() -> Self {
        Self::new(SpaceReservationFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("unknown reservation step `{0}`")]
    UnknownStep(String),
    #[error("SWITCH_STEP from {from} without a nextStep")]
    MissingNextStep { from: SpaceStep },
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: SpaceStep, to: SpaceStep },
    #[error("cannot enter {target} without {missing_fields:?}")]
    MissingReservationData { target: SpaceStep, missing_fields: Vec<String> },
}
