pub mod cache;
pub mod chat_stream;
pub mod config;
pub mod message;
pub mod overlay;
pub mod reconcile;
pub mod session;
