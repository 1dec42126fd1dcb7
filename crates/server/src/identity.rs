use std::collections::HashMap;

use async_trait::async_trait;
use concierge_core::{AuthContext, LocalUser, RoomId};
use tokio::sync::RwLock;

/// Maps a chat identity to its portal account.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve(&self, external_user_id: &str) -> Option<LocalUser>;
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, LocalUser>>,
}

impl InMemoryUserDirectory {
    pub fn with_users(users: impl IntoIterator<Item = (String, LocalUser)>) -> Self {
        Self { users: RwLock::new(users.into_iter().collect()) }
    }

    pub async fn insert(&self, external_user_id: impl Into<String>, user: LocalUser) {
        self.users.write().await.insert(external_user_id.into(), user);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn resolve(&self, external_user_id: &str) -> Option<LocalUser> {
        self.users.read().await.get(external_user_id).cloned()
    }
}

pub async fn resolve_auth(
    directory: &dyn UserDirectory,
    external_user_id: &str,
    room_id: RoomId,
    is_direct_message: bool,
) -> AuthContext {
    let user = directory.resolve(external_user_id).await;
    AuthContext::new(external_user_id, room_id, is_direct_message, user)
}

#[cfg(test)]
mod tests {
    use concierge_core::{LocalUser, RoomId};

    use super::{resolve_auth, InMemoryUserDirectory};

    #[tokio::test]
    async fn unknown_sender_resolves_without_local_user() {
        let directory = InMemoryUserDirectory::with_users([(
            "@alice:neohoods.com".to_string(),
            LocalUser::new("u-1", "Alice"),
        )]);

        let known = resolve_auth(&directory, "@alice:neohoods.com", RoomId::new("!a"), true).await;
        let unknown = resolve_auth(&directory, "@eve:elsewhere.org", RoomId::new("!b"), false).await;

        assert_eq!(known.require_user().expect("user").display_name, "Alice");
        assert!(!unknown.has_user());
        assert!(!unknown.is_direct_message);
    }

    #[tokio::test]
    async fn inserted_users_become_resolvable() {
        let directory = InMemoryUserDirectory::default();
        directory.insert("@bob:neohoods.com", LocalUser::new("u-2", "Bob")).await;

        let auth = resolve_auth(&directory, "@bob:neohoods.com", RoomId::new("!c"), true).await;
        assert!(auth.has_user());
    }
}
