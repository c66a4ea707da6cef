// Copyright 2026 Highway RPC Developers

//! Error types for the highway transport.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Every failure the transport can surface to a caller.
#[derive(Debug, Error)]
pub enum HighwayError {
    /// Malformed magic, truncated header or body, a negative computed body
    /// length, or a control header that cannot be parsed. Fatal to the
    /// connection that produced it.
    #[error("framing error: {0}")]
    Framing(String),

    /// The login exchange was rejected or could not be parsed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No response arrived in time. The remote side may still have processed
    /// the request, so the outcome is unknown.
    #[error("send timeout after {timeout:?} (correlation id {correlation_id})")]
    SendTimeout {
        correlation_id: u64,
        timeout: Duration,
    },

    /// The connection carrying the call closed before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer answered with a non-success status.
    #[error("remote error {status}: {reason}")]
    Remote { status: i32, reason: String },

    /// No workers have been created for this destination.
    #[error("destination not found: {0}")]
    DestinationNotFound(String),

    /// The destination's job queue is full and the scheduler rejects instead
    /// of blocking.
    #[error("job queue full for destination {0}")]
    QueueFull(String),

    /// The correlation id is still outstanding on the selected connection.
    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelationId(u64),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HighwayError {
    pub(crate) fn framing<S: Into<String>>(msg: S) -> HighwayError {
        HighwayError::Framing(msg.into())
    }

    pub(crate) fn handshake<S: Into<String>>(msg: S) -> HighwayError {
        HighwayError::Handshake(msg.into())
    }

    /// True for errors after which the connection must not be reused.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            HighwayError::Framing(_)
                | HighwayError::Handshake(_)
                | HighwayError::ConnectionClosed
                | HighwayError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HighwayError>;
