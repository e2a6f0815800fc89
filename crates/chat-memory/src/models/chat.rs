use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{SessionError, SessionResult};

pub type ConversationId = String;

/// Current persisted record layout. Bump when a field changes meaning.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Synthetic summary of compacted history
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_name: None,
            tool_result: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(
        name: impl Into<String>,
        content: impl Into<String>,
        result: Option<String>,
    ) -> Self {
        Self {
            tool_name: Some(name.into()),
            tool_result: result,
            ..Self::new(Role::Tool, content)
        }
    }
}

/// Ordered message history of one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub messages: Vec<ChatMessage>,
}

impl Thread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

fn default_schema_version() -> u32 {
    RECORD_SCHEMA_VERSION
}

/// Persisted form of a conversation, shared by the cache payload and the archive document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub persisted: bool,
    #[serde(default)]
    pub persisted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merge_count: u64,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub summary_count: u32,
}

impl SessionRecord {
    pub fn new(created_at: DateTime<Utc>, thread: &Thread) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            created_at,
            updated_at: Utc::now().max(created_at),
            persisted: false,
            persisted_at: None,
            merge_count: 0,
            message_count: thread.len(),
            messages: thread.messages.clone(),
            summary: None,
            summary_count: 0,
        }
    }

    pub fn thread(&self) -> Thread {
        Thread::from_messages(self.messages.clone())
    }

    pub fn into_thread(self) -> Thread {
        Thread::from_messages(self.messages)
    }

    /// Reject layouts this build cannot interpret and repair derived fields.
    pub fn validate(mut self) -> SessionResult<Self> {
        if self.schema_version == 0 || self.schema_version > RECORD_SCHEMA_VERSION {
            return Err(SessionError::InvalidRecord(format!(
                "unsupported schema_version {}",
                self.schema_version
            )));
        }
        if self.updated_at < self.created_at {
            return Err(SessionError::InvalidRecord(format!(
                "updated_at {} precedes created_at {}",
                self.updated_at, self.created_at
            )));
        }
        self.message_count = self.messages.len();
        Ok(self)
    }

    pub fn from_slice(bytes: &[u8]) -> SessionResult<Self> {
        let record: SessionRecord = serde_json::from_slice(bytes)?;
        record.validate()
    }

    pub fn to_vec(&self) -> SessionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Derived view of one live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub message_count: usize,
    pub estimated_token_count: usize,
    pub max_tokens: usize,
    pub needs_summarization: bool,
    pub summary_count: u32,
    pub persisted: bool,
}

/// Archive listing row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSummary {
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub merge_count: u64,
    pub persisted_at: Option<DateTime<Utc>>,
}

impl ArchivedSummary {
    pub fn from_record(conversation_id: impl Into<String>, record: &SessionRecord) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            message_count: record.messages.len(),
            merge_count: record.merge_count,
            persisted_at: record.persisted_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatListItem {
    pub conversation_id: ConversationId,
    pub active: bool,
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListSource {
    Cache,
    #[serde(alias = "persistence")]
    Archival,
    #[default]
    All,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_wire_format_field_names() {
        let mut thread = Thread::new();
        thread.push(ChatMessage::user("My name is Alice"));
        thread.push(ChatMessage::tool("search", "looked up", Some("3 hits".into())));
        let record = SessionRecord::new(Utc::now(), &thread);

        let value = serde_json::to_value(&record).unwrap();
        for field in [
            "created_at",
            "updated_at",
            "persisted",
            "persisted_at",
            "merge_count",
            "message_count",
            "messages",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert!(value.get("summary").is_none());

        let first = &value["messages"][0];
        assert_eq!(first["role"], "user");
        assert!(first.get("tool_name").is_none());
        assert_eq!(value["messages"][1]["tool_name"], "search");
        assert_eq!(value["messages"][1]["tool_result"], "3 hits");
    }

    #[test]
    fn test_minimal_document_fills_defaults() {
        let now = Utc::now();
        let doc = serde_json::json!({
            "created_at": now,
            "updated_at": now,
            "messages": [{"role": "assistant", "content": "hi", "timestamp": now}],
            "some_future_field": true
        });
        let record = SessionRecord::from_slice(&serde_json::to_vec(&doc).unwrap()).unwrap();
        assert_eq!(record.schema_version, RECORD_SCHEMA_VERSION);
        assert_eq!(record.merge_count, 0);
        assert_eq!(record.message_count, 1);
        assert!(!record.persisted);
    }

    #[test]
    fn test_validate_rejects_future_schema() {
        let mut record = SessionRecord::new(Utc::now(), &Thread::new());
        record.schema_version = RECORD_SCHEMA_VERSION + 1;
        assert!(matches!(
            record.validate(),
            Err(SessionError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_validate_rejects_time_travel() {
        let mut record = SessionRecord::new(Utc::now(), &Thread::new());
        record.updated_at = record.created_at - Duration::seconds(5);
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(SessionRecord::from_slice(b"not json").is_err());
        assert!(SessionRecord::from_slice(br#"{"messages": "nope"}"#).is_err());
    }

    #[test]
    fn test_list_source_accepts_legacy_name() {
        let source: ListSource = serde_json::from_str("\"persistence\"").unwrap();
        assert_eq!(source, ListSource::Archival);
    }
}
