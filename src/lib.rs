pub mod auth;
pub mod captcha;
pub mod config;
pub mod error;
pub mod markup;
pub mod models;
pub mod openapi;
pub mod pseudoip;
pub mod rate_limit;
pub mod repo;
pub mod routes;
pub mod security;
pub mod storage;

// Re-export commonly used items for tests / external users
pub use routes::{config as route_config, AppState};
pub use security::SecurityHeaders;
