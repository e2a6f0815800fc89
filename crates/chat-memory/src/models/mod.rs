pub mod chat;
pub mod health;

pub use chat::{
    ArchivedSummary, ChatListItem, ChatMessage, ConversationId, ListSource, Role, SessionRecord,
    SessionStats, Thread, RECORD_SCHEMA_VERSION,
};
pub use health::{ComponentCheck, HealthReport, HealthStatus};
