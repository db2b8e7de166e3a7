//! Document-store wire protocol.
//!
//! Clients open a WebSocket, send [`ClientFrame::Hello`] naming the owner
//! they act for, then issue [`ClientFrame::Request`]s. The server answers each
//! request with a [`ServerFrame::Reply`] carrying the same `request_id` and
//! pushes [`ServerFrame::Changes`] for every live subscription.

use serde::{Deserialize, Serialize};

use crate::document::{ChangeBatch, Document, Fields, Filter, Query};

/// An operation against one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    /// Insert a new document; the server assigns its ID.
    Create {
        /// Target collection.
        collection: String,
        /// Initial field values.
        fields: Fields,
    },
    /// Merge `patch` into an existing document.
    Update {
        /// Target collection.
        collection: String,
        /// Document ID.
        id: String,
        /// Fields to overwrite.
        patch: Fields,
    },
    /// Remove a document. Deleting an absent document succeeds.
    Delete {
        /// Target collection.
        collection: String,
        /// Document ID.
        id: String,
    },
    /// One-shot selection.
    Query {
        /// Target collection.
        collection: String,
        /// Selection criteria.
        query: Query,
    },
    /// Start a live change feed for documents matching `filters`.
    Subscribe {
        /// Target collection.
        collection: String,
        /// All must match for a document to be visible.
        filters: Vec<Filter>,
    },
    /// Stop a live change feed.
    Unsubscribe {
        /// ID returned by [`StoreReply::Subscribed`].
        subscription_id: u64,
    },
}

/// Successful outcome of a [`StoreOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreReply {
    /// The document was created under `id`.
    Created {
        /// Server-assigned document ID.
        id: String,
    },
    /// The mutation was applied.
    Done,
    /// Query results.
    Documents(Vec<Document>),
    /// The subscription is live.
    Subscribed {
        /// Identifies the feed in later [`ServerFrame::Changes`].
        subscription_id: u64,
    },
}

/// Failed outcome of a [`StoreOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreFailure {
    /// No document with this ID exists.
    NotFound {
        /// The missing document ID.
        id: String,
    },
    /// The session owner may not touch this data.
    Unauthorized {
        /// Why access was refused.
        reason: String,
    },
    /// The request was malformed or violated a store rule.
    Rejected {
        /// What was wrong.
        reason: String,
    },
    /// The server failed internally.
    Internal {
        /// Diagnostic text.
        reason: String,
    },
}

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Establishes the owner this connection acts for.
    ///
    /// Must be the first frame. Sending it again switches owner and drops
    /// every subscription of the connection.
    Hello {
        /// Opaque owner identifier.
        owner: String,
    },
    /// A correlated operation.
    Request {
        /// Client-chosen correlation ID echoed in the reply.
        request_id: u64,
        /// The operation.
        op: StoreOp,
    },
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Acknowledges a [`ClientFrame::Hello`].
    Welcome {
        /// The owner now in effect (echoed back).
        owner: String,
    },
    /// Answer to a [`ClientFrame::Request`].
    Reply {
        /// Correlation ID from the request.
        request_id: u64,
        /// Outcome of the operation.
        outcome: Result<StoreReply, StoreFailure>,
    },
    /// Changes for one live subscription.
    Changes {
        /// Which feed these changes belong to.
        subscription_id: u64,
        /// The changes.
        batch: ChangeBatch,
    },
    /// A connection-level error not tied to a request.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}
