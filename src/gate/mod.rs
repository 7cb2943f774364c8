//! Gateway HTTP front end
//!
//! Serves the OpenAI-compatible caller API and, when an admin token is
//! configured, the `/admin` management API.

pub mod admin;
pub mod config;
mod error;
pub mod handlers;
pub mod server;

pub use config::{GatewayConfig, LogFormat};
pub use error::error_body;
pub use handlers::GatewayState;
pub use server::{build_router, open_state, start_server};
