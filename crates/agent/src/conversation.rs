use chrono::{DateTime, Duration, Utc};
use concierge_core::WorkflowType;
use serde_json::Value;

use crate::llm::{ClassifierReply, HistoryMessage, MessageRole};

const RESERVATION_KEYWORDS: [&str; 5] = ["réserv", "reserv", "booking", "book", "parking"];

/// Recent slice of room history handed to the classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryWindow {
    pub max_messages: usize,
    pub max_age: Duration,
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self { max_messages: 10, max_age: Duration::minutes(15) }
    }
}

impl HistoryWindow {
    pub fn new(max_messages: usize, max_age: Duration) -> Self {
        Self { max_messages, max_age }
    }

    /// Keeps the last `max_messages` messages younger than `max_age`, oldest first.
    pub fn apply(&self, history: &[HistoryMessage], now: DateTime<Utc>) -> Vec<HistoryMessage> {
        let cutoff = now - self.max_age;
        let recent = history
            .iter()
            .filter(|message| message.sent_at >= cutoff && !message.content.trim().is_empty())
            .collect::<Vec<_>>();
        let skip = recent.len().saturating_sub(self.max_messages);
        recent.into_iter().skip(skip).cloned().collect()
    }

    pub fn render(messages: &[HistoryMessage]) -> String {
        messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                };
                format!("{role}: {}", message.content.trim())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn is_short_followup(message: &str, max_chars: usize) -> bool {
    let trimmed = message.trim();
    !trimmed.is_empty() && trimmed.chars().count() <= max_chars
}

pub fn mentions_reservation(message: &str) -> bool {
    let normalized = normalize_text(message);
    RESERVATION_KEYWORDS.iter().any(|keyword| normalized.contains(keyword))
}

/// Bare numeric answer such as "2" or "n°2", as given when picking from a list.
pub fn selected_number(message: &str) -> Option<u32> {
    let tokens = tokenize(&normalize_text(message));
    match tokens.as_slice() {
        [single] => single.trim_start_matches("n°").trim_start_matches('#').parse().ok(),
        [prefix, number] if matches!(prefix.as_str(), "numéro" | "numero" | "le" | "la" | "n°") => {
            number.parse().ok()
        }
        _ => None,
    }
}

/// Reads the routing decision from a classifier reply: forced tool arguments
/// first, then any workflow name found in plain content.
pub fn parse_route_decision(reply: &ClassifierReply) -> Option<WorkflowType> {
    let from_arguments = reply
        .tool_arguments
        .as_ref()
        .and_then(|arguments| match arguments {
            Value::Object(map) => map.get("workflow").and_then(Value::as_str).map(str::to_owned),
            Value::String(raw) => serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|parsed| parsed.get("workflow").and_then(Value::as_str).map(str::to_owned)),
            _ => None,
        })
        .and_then(|raw| raw.parse::<WorkflowType>().ok());
    if from_arguments.is_some() {
        return from_arguments;
    }

    let content = reply.content.as_deref()?;
    let content = strip_code_fences(content);
    if let Some(workflow) = serde_json::from_str::<Value>(content)
        .ok()
        .and_then(|parsed| parsed.get("workflow").and_then(Value::as_str).map(str::to_owned))
        .and_then(|raw| raw.parse::<WorkflowType>().ok())
    {
        return Some(workflow);
    }

    content
        .split(|character: char| !(character.is_ascii_alphanumeric() || character == '_'))
        .find_map(|word| {
            if word.is_empty() || word.chars().any(|character| character.is_ascii_lowercase()) {
                return None;
            }
            word.parse::<WorkflowType>().ok()
        })
}

/// Removes a surrounding ```json fence if the model wrapped its answer in one.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    let inner = inner.trim_start_matches(|character: char| character.is_ascii_alphabetic());
    inner.trim()
}

pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() || matches!(character, '°' | '#') {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use concierge_core::WorkflowType;
    use serde_json::json;

    use super::{
        is_short_followup, mentions_reservation, parse_route_decision, selected_number,
        strip_code_fences, HistoryWindow,
    };
    use crate::llm::{ClassifierReply, HistoryMessage};

    #[test]
    fn history_window_keeps_recent_tail() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).single().expect("valid instant");
        let mut history = vec![HistoryMessage::user("très ancien", now - Duration::minutes(40))];
        for minute in (0..12).rev() {
            history.push(HistoryMessage::user(format!("message {minute}"), now - Duration::minutes(minute)));
        }

        let window = HistoryWindow::default().apply(&history, now);

        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "message 9");
        assert_eq!(window[9].content, "message 0");
        assert!(HistoryWindow::new(10, Duration::minutes(5)).apply(&history, now).len() == 6);
    }

    #[test]
    fn short_followups_and_reservation_mentions() {
        assert!(is_short_followup("oui, le 2", 18));
        assert!(!is_short_followup("   ", 18));
        assert!(!is_short_followup("je voudrais plutôt la salle commune", 18));

        assert!(mentions_reservation("Je veux RÉSERVER une place"));
        assert!(mentions_reservation("parking demain ?"));
        assert!(!mentions_reservation("Quel est le code du local vélo ?"));
    }

    #[test]
    fn selected_number_accepts_common_forms() {
        assert_eq!(selected_number("2"), Some(2));
        assert_eq!(selected_number(" n°3 "), Some(3));
        assert_eq!(selected_number("le 1"), Some(1));
        assert_eq!(selected_number("2 places"), None);
        assert_eq!(selected_number("deux"), None);
    }

    #[test]
    fn route_decision_prefers_tool_arguments_then_content() {
        let reply = ClassifierReply {
            tool_arguments: Some(json!({"workflow": "space", "reason": "parking"})),
            content: Some("GENERAL".to_owned()),
        };
        assert_eq!(parse_route_decision(&reply), Some(WorkflowType::Space));

        let reply = ClassifierReply {
            tool_arguments: Some(json!("{\"workflow\":\"RESIDENT_INFO\"}")),
            content: None,
        };
        assert_eq!(parse_route_decision(&reply), Some(WorkflowType::ResidentInfo));

        let reply = ClassifierReply {
            tool_arguments: Some(json!({"workflow": "WEATHER"})),
            content: Some("```json\n{\"workflow\": \"HELP\"}\n```".to_owned()),
        };
        assert_eq!(parse_route_decision(&reply), Some(WorkflowType::Help));

        let reply = ClassifierReply { tool_arguments: None, content: Some("Workflow: SUPPORT.".to_owned()) };
        assert_eq!(parse_route_decision(&reply), Some(WorkflowType::Support));

        let reply = ClassifierReply { tool_arguments: None, content: Some("je ne sais pas".to_owned()) };
        assert_eq!(parse_route_decision(&reply), None);
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }
}
