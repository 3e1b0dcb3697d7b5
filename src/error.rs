//! Error types for the notification hub
//!
//! Defines transport errors, queue errors, hub submission errors and
//! inbound frame errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Transport-level errors
///
/// Always fatal to the one connection they occur on.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake carried no usable user identity
    #[error("Missing or invalid user_id in handshake")]
    MissingUserId,

    /// Hub is unavailable
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
}

/// Outbound queue errors
///
/// Returned by a non-blocking enqueue onto a connection's queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The queue is at capacity; the consumer is not keeping up
    #[error("Queue full")]
    QueueFull,
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Hub submission errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The coordinator has stopped
    #[error("Hub stopped")]
    Stopped,
    /// The coordinator's command queue is full; the submission was dropped
    #[error("Hub saturated")]
    Saturated,
}

/// Inbound frame decode errors
///
/// Reported back to the sending connection; never fatal.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not valid JSON or not an envelope
    #[error("Invalid message format: {0}")]
    Malformed(String),
    /// Recognized type with a payload that does not fit it
    #[error("Invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },
    /// Type tag the hub does not handle
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
    /// Binary frames are not part of the protocol
    #[error("Binary messages not supported")]
    Binary,
}
