use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::models::{ChatListItem, ListSource, SessionStats};
use crate::services::session::DeleteReport;
use crate::services::SessionManager;
use crate::utils::ApiError;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ListChatsQuery {
    #[serde(default)]
    pub source: ListSource,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListChatsResponse {
    pub chats: Vec<ChatListItem>,
    pub total: usize,
}

pub async fn list_chats_handler(
    State(manager): State<Arc<SessionManager>>,
    Query(query): Query<ListChatsQuery>,
) -> Result<Json<ListChatsResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    let chats = manager.list_chats(query.source, limit).await?;
    Ok(Json(ListChatsResponse {
        total: chats.len(),
        chats,
    }))
}

pub async fn chat_stats_handler(
    State(manager): State<Arc<SessionManager>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<SessionStats>, ApiError> {
    manager
        .get_session_stats(&conversation_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No live session {}", conversation_id)))
}

/// 200 when removed somewhere, 404 when no tier held it, 503 when a tier
/// failed (the report says which).
pub async fn delete_chat_handler(
    State(manager): State<Arc<SessionManager>>,
    Path(conversation_id): Path<String>,
) -> Result<(StatusCode, Json<DeleteReport>), ApiError> {
    info!("Delete request for {}", conversation_id);
    let report = manager.delete_chat_detailed(&conversation_id).await?;

    let status = if report.has_failures() {
        StatusCode::SERVICE_UNAVAILABLE
    } else if report.deleted() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchivalTier, MemoryArchiveStore};
    use crate::cache::CacheTier;
    use crate::config::Settings;
    use crate::models::{ChatMessage, Thread};

    fn manager() -> Arc<SessionManager> {
        let settings = Settings::default();
        let cache = Arc::new(CacheTier::new(None, &settings.cache));
        let archive = Arc::new(ArchivalTier::new(
            Arc::new(MemoryArchiveStore::new()),
            &settings.archive,
        ));
        Arc::new(SessionManager::new(Some(cache), Some(archive), None, &settings).unwrap())
    }

    #[tokio::test]
    async fn test_list_rejects_bad_limit() {
        let result = list_chats_handler(
            State(manager()),
            Query(ListChatsQuery {
                source: ListSource::All,
                limit: Some(0),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_stats_and_delete_status_codes() {
        let manager = manager();
        manager
            .save_thread("s1", &Thread::from_messages(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();

        let Json(stats) = chat_stats_handler(State(manager.clone()), Path("s1".into()))
            .await
            .unwrap();
        assert_eq!(stats.message_count, 1);

        let (status, _) = delete_chat_handler(State(manager.clone()), Path("s1".into()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);

        let (status, Json(report)) = delete_chat_handler(State(manager.clone()), Path("s1".into()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!report.deleted());

        assert!(matches!(
            chat_stats_handler(State(manager), Path("s1".into())).await,
            Err(ApiError::NotFound(_))
        ));
    }
}
