use thiserror::Error;

use crate::flows::FlowTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("no portal account is linked to `{external_user_id}`")]
    Unauthorized { external_user_id: String },
    #[error("unknown workflow `{0}`")]
    UnknownWorkflow(String),
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("llm provider failure: {0}")]
    Provider(String),
    #[error("workflow classification failed: {0}")]
    Classification(String),
    #[error("no conversation found for room `{room_id}`")]
    NoConversation { room_id: String },
    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("turn aborted after {rounds} tool-call rounds")]
    TurnLimitExceeded { rounds: u32 },
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, correlation_id: String },
    #[error("rephrase requested: {message}")]
    Rephrase { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => {
                "Je ne parviens pas à vous identifier sur le portail. Merci de lier votre compte avant de continuer."
            }
            Self::Rephrase { .. } => {
                "Je n'ai pas compris votre message. Pouvez-vous reformuler ?"
            }
            Self::ServiceUnavailable { .. } => {
                "Désolé, je rencontre un problème technique. Veuillez réessayer dans quelques instants."
            }
            Self::Internal { .. } => "Désolé, une erreur inattendue s'est produite.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Unauthorized { correlation_id, .. }
            | Self::Rephrase { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::Unauthorized { correlation_id: id, .. }
            | InterfaceError::Rephrase { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Domain(DomainError::Unauthorized { .. }))
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::Unauthorized { external_user_id }) => {
                Self::Unauthorized { message: external_user_id, correlation_id }
            }
            ApplicationError::Domain(DomainError::UnknownWorkflow(message)) => {
                Self::Rephrase { message, correlation_id }
            }
            error @ ApplicationError::TurnLimitExceeded { .. } => {
                Self::Rephrase { message: error.to_string(), correlation_id }
            }
            ApplicationError::Provider(message) | ApplicationError::Classification(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            error @ ApplicationError::ToolExecution { .. } => {
                Self::ServiceUnavailable { message: error.to_string(), correlation_id }
            }
            error @ (ApplicationError::Domain(_) | ApplicationError::NoConversation { .. }) => {
                Self::Internal { message: error.to_string(), correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
