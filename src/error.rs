// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Error taxonomy shared by the router, the store and the transport

use thiserror::Error;

/// Inbound message could not be turned into an event
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    /// Payload was not valid UTF-8 / JSON or did not match the expected shape
    #[error("malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },

    /// Command channel carried something other than lock/unlock
    #[error("invalid command '{requested}' from {source_id}")]
    InvalidCommand { requested: String, source_id: String },
}

/// Persistence backend failed; callers keep running on in-memory state
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
}

/// Broker connectivity failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    /// Session dropped without a shutdown request
    #[error("broker connection lost: {0}")]
    Lost(String),

    /// Retry budget spent; the process must terminate
    #[error("broker unreachable after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },
}
