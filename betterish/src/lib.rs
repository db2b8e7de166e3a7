//! Betterish: optimistic task state management over a live document store.
//!
//! - [`store`]: the document store abstraction and its in-memory and
//!   WebSocket implementations
//! - [`tasks`]: the task view, reducer, optimistic controller and live sync
//! - [`session`]: wiring one owner's controller to a store

pub mod config;
pub mod render;
pub mod session;
pub mod store;
pub mod tasks;
