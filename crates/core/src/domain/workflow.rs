use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

/// Identifier issued by the external conversation API. A new one is issued on
/// every append, so only the latest value held by the session manager is valid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

string_id!(RoomId);
string_id!(AgentId);
string_id!(ConversationId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    General,
    ResidentInfo,
    #[serde(alias = "RESERVATION")]
    Space,
    Help,
    Support,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 5] =
        [Self::General, Self::ResidentInfo, Self::Space, Self::Help, Self::Support];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "GENERAL",
            Self::ResidentInfo => "RESIDENT_INFO",
            Self::Space => "SPACE",
            Self::Help => "HELP",
            Self::Support => "SUPPORT",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::General => "general questions, greetings, small talk",
            Self::ResidentInfo => "residents, neighbours, building information, emergency numbers",
            Self::Space => "common spaces, parking spots, availability and reservations",
            Self::Help => "how to use the assistant and the portal",
            Self::Support => "problems, complaints, requests for a human",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "GENERAL" => Ok(Self::General),
            "RESIDENT_INFO" => Ok(Self::ResidentInfo),
            "SPACE" | "RESERVATION" => Ok(Self::Space),
            "HELP" => Ok(Self::Help),
            "SUPPORT" => Ok(Self::Support),
            other => Err(DomainError::UnknownWorkflow(other.to_owned())),
        }
    }
}
