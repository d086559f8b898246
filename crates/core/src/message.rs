//! Conversation turns and the rolling context window.
//!
//! Every LLM call sees a bounded slice of the conversation: the trailing
//! window of prior turns plus the new user message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System notes (tool results, instructions)
    System,
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// When the turn was produced, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Build the history for an LLM call: the last `window` turns of `prior`
/// followed by `latest`.
pub fn context_window(prior: &[Message], window: usize, latest: Message) -> Vec<Message> {
    let start = prior.len().saturating_sub(window);
    let mut history = Vec::with_capacity(prior.len() - start + 1);
    history.extend_from_slice(&prior[start..]);
    history.push(latest);
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("turn {i}"))).collect()
    }

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert!(msg.timestamp.is_some());
    }

    #[test]
    fn window_keeps_trailing_turns_plus_new_message() {
        let history = context_window(&turns(25), 10, Message::user("latest"));
        assert_eq!(history.len(), 11);
        assert_eq!(history[0].content, "turn 15");
        assert_eq!(history[9].content, "turn 24");
        assert_eq!(history[10].content, "latest");
    }

    #[test]
    fn window_with_short_history_keeps_everything() {
        let history = context_window(&turns(3), 10, Message::user("latest"));
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "turn 0");
    }

    #[test]
    fn window_with_no_history() {
        let history = context_window(&[], 10, Message::user("only"));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "only");
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::system("x")).unwrap();
        assert!(json.contains("\"role\":\"system\""));
        let parsed: Message = serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(parsed.role, Role::Assistant);
        assert!(parsed.timestamp.is_none());
    }
}
