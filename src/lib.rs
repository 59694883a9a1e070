//! Sessiongate - an authenticating gateway that gives every user their own
//! backend process
//!
//! This library provides:
//! - A supervisor that launches backend processes and reports their exits
//!   as messages, woken by SIGCHLD
//! - A per-identity session registry with coalesced, cancellation-safe launches
//! - Signed-cookie and static-token authentication with redirect or 401 per route
//! - A lock-free route table over an HTTP/1.1 and HTTP/2 server
//! - A streaming reverse proxy into the caller's session, relaunching once
//!   when a supposedly live backend has gone away

pub mod auth;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod launcher;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod supervisor;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
