//! Conversation turns and tool progress as produced by the agent loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    ToolResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// One full conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub uuid: String,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(
            MessageRole::Assistant,
            vec![ContentBlock::Text { text: text.into() }],
        )
    }

    /// Assistant turn invoking a single tool.
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::new(
            MessageRole::Assistant,
            vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
        )
    }

    /// Ids of the tool invocations in this message, in block order.
    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// First text block, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Status update for one tool invocation. Persisted entries are milestones
/// that stay in history; transient ones are live status shown until
/// superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub tool_use_id: String,
    #[serde(default)]
    pub persisted: bool,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProgressEntry {
    pub fn milestone(tool_use_id: impl Into<String>, content: Value) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            persisted: true,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn live(tool_use_id: impl Into<String>, content: Value) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            persisted: false,
            content,
            timestamp: Some(Utc::now()),
        }
    }
}

/// Element of the raw event stream and of the reconciled display list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Message(ConversationMessage),
    Progress(ProgressEntry),
}

impl StreamEvent {
    pub fn as_progress(&self) -> Option<&ProgressEntry> {
        match self {
            Self::Progress(entry) => Some(entry),
            Self::Message(_) => None,
        }
    }

    pub fn as_message(&self) -> Option<&ConversationMessage> {
        match self {
            Self::Message(message) => Some(message),
            Self::Progress(_) => None,
        }
    }
}
