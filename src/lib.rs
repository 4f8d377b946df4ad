//! Syntra is a terminal client for an enterprise chat backend.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`api`] defines the wire payloads and the HTTP client for the chat
//!   service, including conversation history and mutations.
//! - [`auth`] signs users in and keeps the session token in the system keyring.
//! - [`core`] owns the synchronization engine: the streaming transport, the
//!   session cache, the optimistic overlay, reconciliation of server history
//!   with locally shown messages, and the session controller that drives them.
//! - [`cli`] parses arguments and runs one-shot commands and the interactive chat.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod auth;
pub mod cli;
pub mod core;
pub mod utils;
