pub mod archive;
pub mod cache;
pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;
