// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the gateway.
#[derive(Error, Debug)]
pub enum NexusError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Peer '{0}' is gone")]
    PeerGone(String),

    #[error("Outbound queue for peer '{0}' is full")]
    QueueFull(String),

    #[error("No live worker available")]
    NoWorkerAvailable,

    #[error("No such stream '{0}'")]
    StreamNotFound(String),

    #[error("NOGROUP No such consumer group '{0}'")]
    ConsumerGroupNotFound(String),

    #[error("Operation against a queue holding the wrong kind of value")]
    WrongType,
}
