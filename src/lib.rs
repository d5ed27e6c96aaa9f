//! External-processing interceptor for an LLM gateway.
//!
//! The proxy forwards every client exchange over a bridge connection; this
//! crate routes it to a backend, rewrites the request and response between
//! the client's OpenAI schema and the backend's schema, attaches backend
//! credentials and reports token usage as dynamic metadata.

pub mod auth;
pub mod config;
mod error;
pub mod logging;
pub mod observability;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod server;
pub mod session;
pub mod translator;
pub mod utils;

pub use error::{ExtProcError, Result};
