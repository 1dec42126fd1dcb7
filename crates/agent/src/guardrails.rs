use concierge_core::{AuthContext, WorkflowType};

use crate::tools::ToolAccess;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailIntent {
    ToolCall { tool: String, access: ToolAccess },
    EnterWorkflow { workflow: WorkflowType },
}

impl GuardrailIntent {
    pub fn action_key(&self) -> String {
        match self {
            Self::ToolCall { tool, .. } => format!("tool.{tool}"),
            Self::EnterWorkflow { workflow } => {
                format!("workflow.{}", workflow.as_str().to_ascii_lowercase())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String, fallback_path: &'static str },
    Degrade { reason_code: &'static str, user_message: String, fallback_path: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub mutating_tools_enabled: bool,
    pub require_direct_message_for_space: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { mutating_tools_enabled: true, require_direct_message_for_space: true }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(&self, intent: &GuardrailIntent, auth: &AuthContext) -> GuardrailDecision {
        match intent {
            GuardrailIntent::ToolCall { access: ToolAccess::ReadOnly, .. } => {
                GuardrailDecision::Allow
            }
            GuardrailIntent::ToolCall { access: ToolAccess::Mutating, .. } if !auth.has_user() => {
                GuardrailDecision::Deny {
                    reason_code: "unresolved_local_user",
                    user_message:
                        "Cette action nécessite un compte du portail lié à votre identifiant."
                            .to_string(),
                    fallback_path: "link_portal_account",
                }
            }
            GuardrailIntent::ToolCall { access: ToolAccess::Mutating, .. }
                if !self.mutating_tools_enabled =>
            {
                GuardrailDecision::Degrade {
                    reason_code: "mutating_tools_disabled",
                    user_message: "Les réservations sont temporairement indisponibles depuis le chat."
                        .to_string(),
                    fallback_path: "portal_web_reservation",
                }
            }
            GuardrailIntent::ToolCall { .. } => GuardrailDecision::Allow,
            GuardrailIntent::EnterWorkflow { workflow: WorkflowType::Space }
                if self.require_direct_message_for_space && !auth.is_direct_message =>
            {
                GuardrailDecision::Degrade {
                    reason_code: "space_requires_direct_message",
                    user_message: "Pour réserver un espace, écrivez-moi en message privé afin que je puisse traiter votre demande en toute confidentialité."
                        .to_string(),
                    fallback_path: "direct_message",
                }
            }
            GuardrailIntent::EnterWorkflow { .. } => GuardrailDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use concierge_core::{AuthContext, LocalUser, RoomId, WorkflowType};

    use super::{GuardrailDecision, GuardrailIntent, GuardrailPolicy};
    use crate::tools::ToolAccess;

    fn auth(user: bool, direct: bool) -> AuthContext {
        AuthContext::new(
            "@alice:neohoods.com",
            RoomId::new("!room"),
            direct,
            user.then(|| LocalUser::new("u-1", "Alice")),
        )
    }

    #[test]
    fn read_only_tool_is_allowed_without_user() {
        let decision = GuardrailPolicy::default().evaluate(
            &GuardrailIntent::ToolCall { tool: "list_spaces".to_string(), access: ToolAccess::ReadOnly },
            &auth(false, true),
        );
        assert_eq!(decision, GuardrailDecision::Allow);
    }

    #[test]
    fn mutating_tool_without_user_is_denied() {
        let decision = GuardrailPolicy::default().evaluate(
            &GuardrailIntent::ToolCall {
                tool: "create_reservation".to_string(),
                access: ToolAccess::Mutating,
            },
            &auth(false, true),
        );

        let (reason_code, fallback_path) = match decision {
            GuardrailDecision::Deny { reason_code, fallback_path, .. } => (reason_code, fallback_path),
            _ => ("", ""),
        };
        assert_eq!(reason_code, "unresolved_local_user");
        assert_eq!(fallback_path, "link_portal_account");
    }

    #[test]
    fn disabled_mutations_degrade() {
        let policy = GuardrailPolicy { mutating_tools_enabled: false, ..GuardrailPolicy::default() };
        let decision = policy.evaluate(
            &GuardrailIntent::ToolCall {
                tool: "generate_payment_link".to_string(),
                access: ToolAccess::Mutating,
            },
            &auth(true, true),
        );
        assert!(matches!(
            decision,
            GuardrailDecision::Degrade { reason_code: "mutating_tools_disabled", .. }
        ));
    }

    #[test]
    fn space_workflow_in_group_room_degrades_to_direct_message() {
        let intent = GuardrailIntent::EnterWorkflow { workflow: WorkflowType::Space };
        assert_eq!(intent.action_key(), "workflow.space");

        let decision = GuardrailPolicy::default().evaluate(&intent, &auth(true, false));
        let user_message = match decision {
            GuardrailDecision::Degrade { user_message, .. } => user_message,
            _ => String::new(),
        };
        assert!(user_message.contains("message privé"));

        let decision = GuardrailPolicy::default().evaluate(&intent, &auth(true, true));
        assert_eq!(decision, GuardrailDecision::Allow);
    }
}
