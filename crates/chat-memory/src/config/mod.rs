pub mod settings;

pub use settings::{
    ArchiveConfig, CacheAuthConfig, CacheAuthMode, CacheConfig, LlmConfig, ServerConfig,
    Settings, SummarizationConfig,
};
