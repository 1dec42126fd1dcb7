use serde::{Deserialize, Serialize};

use crate::domain::workflow::RoomId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Portal account resolved from the chat identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: UserId,
    pub display_name: String,
    pub email: Option<String>,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { id: UserId(id.into()), display_name: display_name.into(), email: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub external_user_id: String,
    pub room_id: RoomId,
    pub is_direct_message: bool,
    pub user: Option<LocalUser>,
}

impl AuthContext {
    pub fn new(
        external_user_id: impl Into<String>,
        room_id: RoomId,
        is_direct_message: bool,
        user: Option<LocalUser>,
    ) -> Self {
        Self { external_user_id: external_user_id.into(), room_id, is_direct_message, user }
    }

    pub fn has_user(&self) -> bool {
        self.user.is_some()
    }

    /// Fails closed when the chat identity could not be mapped to a portal account.
    pub fn require_user(&self) -> Result<&LocalUser, DomainError> {
        self.user.as_ref().ok_or_else(|| DomainError::Unauthorized {
            external_user_id: self.external_user_id.clone(),
        })
    }
}
