use serde::{Deserialize, Serialize};

/// Marker that leaves the conversation open for the model's reply.
pub const ASSISTANT_MARKER: &str = "Assistant: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn tag(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

pub fn format_chat(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(message.role.tag());
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push_str("\n\n");
    }
    prompt.push_str(ASSISTANT_MARKER);
    prompt
}

/// Code completion uses the code itself as the prompt prefix.
pub fn format_complete(code: &str) -> String {
    code.to_string()
}
