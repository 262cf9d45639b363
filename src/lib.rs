//! Chat client for the MGDI chat API: an HTTP transport with a streaming
//! `data:` framer, a conversation store with a persisted snapshot, and a
//! terminal front end.

pub mod api;
pub mod config;
pub mod console;
pub mod message;
pub mod settings;
pub mod storage;
pub mod store;
pub mod stream;
