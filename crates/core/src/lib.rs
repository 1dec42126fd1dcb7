pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use domain::auth::{AuthContext, LocalUser, UserId};
pub use domain::workflow::{AgentId, ConversationId, RoomId, WorkflowType};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{SpaceStep, StepResult, StepStatus};
