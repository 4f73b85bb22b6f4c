//! HTTP and WebSocket surface: bearer auth, the `/ws` upgrade into a
//! real-time session, and the `/api/v1` JSON routes.

pub mod api;
pub mod auth;
pub mod config;
pub mod routes;
pub mod server;

pub use api::ApiError;
pub use auth::{AuthError, JwtAuth};
pub use config::{ConfigError, LoggingConfig, ServerConfig};
pub use server::{build_router, start, AppState, ServerError, ServerHandle};
