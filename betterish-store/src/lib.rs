//! Betterish document store server library.
//!
//! Exposes the server for use in tests and embedding. The server accepts
//! WebSocket connections, scopes each one to an owner, serves document
//! operations and pushes live change feeds.

pub mod config;
pub mod server;
pub mod store;
