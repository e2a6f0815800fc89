pub mod llm_service;
pub mod session;

pub use llm_service::LlmCompletionService;
pub use session::SessionManager;
