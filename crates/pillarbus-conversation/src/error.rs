//! Error types for the conversation engine.

use crate::message::ResponseCode;
use crate::types::{ContributorId, ConversationId, Destination};
use thiserror::Error;

/// Errors raised while sending a message on the bus.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Nothing is subscribed to the destination.
    #[error("no route to destination {destination}")]
    NoRoute {
        /// The unreachable destination.
        destination: Destination,
    },

    /// The bus (or the subscriber's queue) has been closed.
    #[error("channel closed for destination {destination}")]
    ChannelClosed {
        /// Destination whose channel was closed.
        destination: Destination,
    },
}

/// Errors that can occur in the conversation engine.
#[derive(Debug, Error)]
pub enum ConversationError {
    /// A construction-time contract was violated (e.g. empty contributor set).
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: String,
    },

    /// A response was missing its status or response code.
    #[error("malformed response from {contributor}: {reason}")]
    MalformedResponse {
        /// The responder.
        contributor: ContributorId,
        /// What part of the response was missing or invalid.
        reason: String,
    },

    /// The contributor explicitly declined.
    #[error("negative response from {contributor} ({code:?}): {text}")]
    NegativeResponse {
        /// The responder.
        contributor: ContributorId,
        /// The response code it sent.
        code: ResponseCode,
        /// Server-supplied explanation.
        text: String,
    },

    /// Sending a message failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A conversation with this ID is already registered.
    #[error("conversation {id} is already registered")]
    DuplicateConversation {
        /// The conflicting conversation ID.
        id: ConversationId,
    },

    /// No conversation with this ID is registered.
    #[error("unknown conversation {id}")]
    UnknownConversation {
        /// The missing conversation ID.
        id: ConversationId,
    },

    /// Settings are inconsistent or incomplete.
    #[error("configuration error: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// A wire frame could not be decoded.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),
}

impl ConversationError {
    /// Shorthand for an [`ConversationError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        ConversationError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Result alias for conversation engine operations.
pub type Result<T> = std::result::Result<T, ConversationError>;
