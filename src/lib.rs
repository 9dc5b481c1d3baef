//! coder2api - one HTTP endpoint in front of several local coding-assistant APIs
//!
//! This library provides:
//! - A supervisor that launches every configured backend as a child process,
//!   with per-service log files, and stops them all on shutdown
//! - A reverse proxy that routes by the first path segment to a backend on
//!   127.0.0.1 and relays the response unchanged
//! - Exec-style delegation to a single backend's command

pub mod config;
pub mod error;
pub mod exec;
pub mod process;
pub mod proxy;
pub mod routing;
pub mod supervisor;
pub mod upstream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
