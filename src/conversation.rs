use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}

/// Which system message to carry over when deriving a new conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessagePick {
    First,
    Last,
}

/// Options for rendering a conversation as plain text.
#[derive(Debug, Clone)]
pub struct FormatOptions<'a> {
    pub include_system_message: bool,
    pub include_last: bool,
    /// Template with `{role}` and `{content}` placeholders.
    pub message_template: &'a str,
    pub newline: &'a str,
    pub limit: Option<usize>,
}

impl Default for FormatOptions<'_> {
    fn default() -> Self {
        Self {
            include_system_message: false,
            include_last: true,
            message_template: "[{role}]: {content} ",
            newline: "\n\n",
            limit: None,
        }
    }
}

/// Ordered chat history passed to language model collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }

    /// Single-turn conversation holding one user message.
    pub fn from_user(content: impl Into<String>) -> Self {
        let mut conversation = Self::new();
        conversation.add(Role::User, content);
        conversation
    }

    pub fn add(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message::new(role, content));
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn insert(&mut self, index: usize, message: Message) {
        self.messages.insert(index, message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Every message except the last one.
    pub fn history(&self) -> &[Message] {
        match self.messages.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    pub fn system_message(&self, pick: SystemMessagePick) -> Option<&Message> {
        let mut system = self.messages.iter().filter(|m| m.role == Role::System);
        match pick {
            SystemMessagePick::First => system.next(),
            SystemMessagePick::Last => system.last(),
        }
    }

    /// Replaces all system messages with `message`, placed first.
    pub fn update_system_message(&mut self, message: Message) {
        let rest = std::mem::take(&mut self.messages)
            .into_iter()
            .filter(|m| m.role != Role::System);
        self.messages = std::iter::once(message).chain(rest).collect();
    }

    /// Empty conversation, optionally seeded with one of this conversation's system messages.
    pub fn derive(&self, with_system_message: Option<SystemMessagePick>) -> Self {
        let mut conversation = Self::new();
        if let Some(pick) = with_system_message
            && let Some(system) = self.system_message(pick)
        {
            conversation.update_system_message(system.clone());
        }
        conversation
    }

    pub fn format(&self, options: &FormatOptions<'_>) -> String {
        let mut messages: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| options.include_system_message || m.role != Role::System)
            .collect();

        if !options.include_last {
            messages.pop();
        }

        if let Some(limit) = options.limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }

        messages
            .iter()
            .map(|m| {
                options
                    .message_template
                    .replace("{role}", &m.role.to_string())
                    .replace("{content}", &m.content)
            })
            .collect::<Vec<_>>()
            .join(options.newline)
    }
}
