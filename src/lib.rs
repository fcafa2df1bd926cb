//! Local gateway that exposes an OpenAI-compatible API and forwards chat
//! completions to the upstream provider configured for each model.

pub mod colors;
pub mod config;
pub mod error;
pub mod format;
pub mod gateway;
pub mod http;
pub mod log_sink;
pub mod models;
pub mod server;
pub mod store;
pub mod upstream;

pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayStatus};
