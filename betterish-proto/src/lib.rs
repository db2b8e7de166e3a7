//! Shared task model and document-store wire format for Betterish.

pub mod codec;
pub mod document;
pub mod store;
pub mod task;
