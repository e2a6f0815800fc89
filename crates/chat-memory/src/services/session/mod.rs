pub mod locks;
pub mod manager;
pub mod scheduler;
pub mod summarizer;
pub mod token_counter;

pub use locks::SessionLocks;
pub use manager::{DeleteReport, SessionManager, SessionTurn, TierOutcome};
pub use scheduler::{PersistLedger, PersistPolicy, PersistReport, PersistScheduler};
pub use summarizer::{CompletionProvider, Summarization, Summarizer};
pub use token_counter::TokenCounter;
