//! Chat messages and the history normalization applied before dispatch.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("valid url regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Swap user and assistant; system stays put.
    pub fn inverted(self) -> Role {
        match self {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
            Role::System => Role::System,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user<S: Into<String>>(content: S) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant<S: Into<String>>(content: S) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system<S: Into<String>>(content: S) -> Self {
        ChatMessage {
            role: Role::System,
            content: content.into(),
        }
    }
}

pub type ChatHistory = Vec<ChatMessage>;

/// One record of the request wire format. Role inference happens here:
/// `bot` maps to assistant, everything else to user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRecord {
    pub actor: String,
    #[serde(default)]
    pub text: Option<String>,
}

pub fn from_wire_records(records: Vec<WireRecord>) -> ChatHistory {
    records
        .into_iter()
        .map(|record| ChatMessage {
            role: if record.actor == "bot" {
                Role::Assistant
            } else {
                Role::User
            },
            content: record.text.unwrap_or_default(),
        })
        .collect()
}

/// Ensure the history, excluding system messages, begins with a user record.
///
/// If the first non-system record is not a user record, an empty user record
/// is inserted in front of it. Idempotent.
pub fn rectify(mut history: ChatHistory) -> ChatHistory {
    let first = history.iter().position(|m| m.role != Role::System);
    if let Some(i) = first {
        if history[i].role != Role::User {
            history.insert(i, ChatMessage::user(""));
        }
    }
    history
}

/// Find the latest URL provided by the user and trim the chat history to the
/// message that carried it, with the URL itself stripped from that message.
pub fn extract_last_url(history: &[ChatMessage]) -> (Option<String>, ChatHistory) {
    let mut url = None;
    let mut begin_index = 0;
    for (i, record) in history.iter().enumerate().rev() {
        if record.role != Role::User {
            continue;
        }
        if let Some(found) = URL_REGEX.find_iter(&record.content).last() {
            url = Some(found.as_str().to_string());
            begin_index = i;
            break;
        }
    }

    let mut trimmed: ChatHistory = history[begin_index..].to_vec();
    if let Some(first) = trimmed.first_mut() {
        first.content = URL_REGEX.replace_all(&first.content, "").trim().to_string();
    }
    (url, trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> ChatMessage {
        ChatMessage::user(content)
    }

    fn assistant(content: &str) -> ChatMessage {
        ChatMessage::assistant(content)
    }

    #[test]
    fn test_wire_conversion_alternating() {
        let records = vec![
            WireRecord {
                actor: "user".into(),
                text: Some("hello1".into()),
            },
            WireRecord {
                actor: "bot".into(),
                text: Some("world1".into()),
            },
            WireRecord {
                actor: "user".into(),
                text: None,
            },
        ];
        let history = from_wire_records(records);
        assert_eq!(
            history,
            vec![user("hello1"), assistant("world1"), user("")]
        );
    }

    #[test]
    fn test_wire_conversion_unknown_actor_becomes_user() {
        let records = vec![WireRecord {
            actor: "tool".into(),
            text: Some("x".into()),
        }];
        assert_eq!(from_wire_records(records), vec![user("x")]);
    }

    #[test]
    fn test_rectify_keeps_well_formed_history() {
        let history = vec![
            user("hello1"),
            assistant("world1"),
            user("hello2"),
            assistant("world2"),
        ];
        assert_eq!(rectify(history.clone()), history);
    }

    #[test]
    fn test_rectify_inserts_empty_user_before_assistant() {
        let history = vec![assistant("world1"), user("hello2")];
        assert_eq!(
            rectify(history),
            vec![user(""), assistant("world1"), user("hello2")]
        );
    }

    #[test]
    fn test_rectify_skips_leading_system_messages() {
        let history = vec![
            ChatMessage::system("be nice"),
            assistant("world1"),
            user("hello2"),
        ];
        assert_eq!(
            rectify(history),
            vec![
                ChatMessage::system("be nice"),
                user(""),
                assistant("world1"),
                user("hello2"),
            ]
        );
    }

    #[test]
    fn test_rectify_is_idempotent() {
        let history = vec![assistant("world1"), user("hello2")];
        let once = rectify(history);
        let twice = rectify(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rectify_empty_and_all_system() {
        assert_eq!(rectify(vec![]), vec![]);
        let all_system = vec![ChatMessage::system("a"), ChatMessage::system("b")];
        assert_eq!(rectify(all_system.clone()), all_system);
    }

    #[test]
    fn test_extract_last_url_standalone() {
        let urls = [
            "http://www.example.com",
            "https://www.example.com:8800",
            "https://www.test.com?pageid=123&testid=1524",
            "https://www.test.com/do.html#A",
        ];
        for test_url in urls {
            let history = vec![
                user("hello1"),
                assistant("world1"),
                user(test_url),
                assistant("world2"),
                user("hello2"),
            ];
            let (url, trimmed) = extract_last_url(&history);
            assert_eq!(url.as_deref(), Some(test_url));
            assert_eq!(
                trimmed,
                vec![user(""), assistant("world2"), user("hello2")]
            );
        }
    }

    #[test]
    fn test_extract_last_url_embedded_in_text() {
        let history = vec![
            user("hello1"),
            user("This is a test message! https://www.example.com/a/b"),
            assistant("world2"),
        ];
        let (url, trimmed) = extract_last_url(&history);
        assert_eq!(url.as_deref(), Some("https://www.example.com/a/b"));
        assert_eq!(trimmed[0], user("This is a test message!"));
        assert_eq!(trimmed.len(), 2);
    }

    #[test]
    fn test_extract_last_url_ignores_assistant_urls() {
        let history = vec![user("hello"), assistant("see https://www.example.com")];
        let (url, trimmed) = extract_last_url(&history);
        assert_eq!(url, None);
        assert_eq!(trimmed, history);
    }
}
