pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, FlowEngine, FlowTransitionError, SpaceReservationFlow};
pub use states::{
    FlowContext, ReservationPeriod, SpaceStep, StepDisposition, StepResult, StepStatus,
    TransitionOutcome,
};
