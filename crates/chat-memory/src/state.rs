use axum::extract::FromRef;
use std::sync::Arc;

use crate::services::SessionManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(session_manager: Arc<SessionManager>) -> Self {
        Self { session_manager }
    }
}

impl FromRef<AppState> for Arc<SessionManager> {
    fn from_ref(state: &AppState) -> Self {
        state.session_manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_handlers_share_one_manager() {
        let settings = Settings::default();
        let manager = Arc::new(SessionManager::new(None, None, None, &settings).unwrap());
        let state = AppState::new(manager.clone());

        let extracted = Arc::<SessionManager>::from_ref(&state);
        assert!(Arc::ptr_eq(&extracted, &manager));
    }
}
