pub mod error;
pub mod logger;

pub use error::{ApiError, SessionError, SessionResult, Tier};
