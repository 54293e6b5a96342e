//! Operation events and the sinks that deliver them to calling code.
//!
//! A conversation reports everything it does as [`OperationEvent`]s
//! through an [`EventHandler`]. Handlers must not block: the
//! conversation calls them inline from its own task.

use crate::message::OperationResult;
use crate::operation::OperationKind;
use crate::state::Phase;
use crate::types::{ContributorId, ConversationId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// The identify broadcast went out.
    IdentifyRequestSent,
    /// A contributor was selected.
    ComponentIdentified,
    /// Identification ended with at least one selected contributor.
    IdentificationComplete,
    /// Identification ended without any usable contributor.
    NoComponentFound,
    /// The operation request went out to the selected contributors.
    RequestSent,
    /// A contributor reported progress.
    Progress,
    /// A contributor finished the operation.
    ComponentComplete,
    /// A contributor failed the operation.
    ComponentFailed,
    /// The conversation succeeded.
    Complete,
    /// The conversation failed.
    Failed,
}

impl EventType {
    /// True for the two events that end a conversation.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::Complete | EventType::Failed)
    }
}

/// Why a conversation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// No contributor answered the identify request positively.
    NoComponentFound,
    /// Too few contributors completed the operation.
    InsufficientSuccesses {
        /// Contributors that completed.
        completed: usize,
        /// Contributors that were asked.
        selected: usize,
    },
    /// A phase deadline passed with nobody completing.
    Timeout {
        /// The phase that timed out.
        phase: Phase,
    },
    /// The whole-conversation ceiling was exceeded.
    ConversationTimeout,
    /// The caller cancelled the conversation.
    Cancelled,
    /// The identify broadcast could not be sent.
    Transport {
        /// Transport error text.
        msg: String,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoComponentFound => write!(f, "no contributor identified"),
            FailureReason::InsufficientSuccesses {
                completed,
                selected,
            } => write!(f, "{completed} of {selected} contributors completed"),
            FailureReason::Timeout { phase } => write!(f, "TIMEOUT in {phase}"),
            FailureReason::ConversationTimeout => write!(f, "TIMEOUT: conversation ceiling exceeded"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Transport { msg } => write!(f, "transport error: {msg}"),
        }
    }
}

/// One event from one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    /// Event type.
    pub event_type: EventType,
    /// Conversation that emitted the event.
    pub conversation_id: ConversationId,
    /// Operation the conversation performs.
    pub operation: OperationKind,
    /// Contributor the event is about, if any.
    pub contributor: Option<ContributorId>,
    /// Human readable description.
    pub info: String,
    /// Result payload, on `ComponentComplete`.
    pub result: Option<OperationResult>,
    /// Failure reason, on `Failed`.
    pub failure: Option<FailureReason>,
}

impl OperationEvent {
    /// Create an event without contributor, result or failure.
    pub fn new(
        event_type: EventType,
        conversation_id: ConversationId,
        operation: OperationKind,
        info: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            conversation_id,
            operation,
            contributor: None,
            info: info.into(),
            result: None,
            failure: None,
        }
    }

    /// Attach the contributor the event is about.
    pub fn with_contributor(mut self, contributor: ContributorId) -> Self {
        self.contributor = Some(contributor);
        self
    }

    /// Attach a result payload.
    pub fn with_result(mut self, result: Option<OperationResult>) -> Self {
        self.result = result;
        self
    }

    /// Attach a failure reason.
    pub fn with_failure(mut self, reason: FailureReason) -> Self {
        self.failure = Some(reason);
        self
    }
}

impl fmt::Display for OperationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}", self.operation, self.event_type)?;
        if let Some(contributor) = &self.contributor {
            write!(f, " {contributor}")?;
        }
        write!(f, ": {}", self.info)
    }
}

/// Receives events from conversations. Must return promptly.
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    fn handle_event(&self, event: OperationEvent);
}

impl<F> EventHandler for F
where
    F: Fn(OperationEvent) + Send + Sync,
{
    fn handle_event(&self, event: OperationEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel; never blocks.
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl ChannelEventHandler {
    /// Create a handler and the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelEventHandler {
    fn handle_event(&self, event: OperationEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(event = %e.0, "event receiver dropped, discarding event");
        }
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle_event(&self, event: OperationEvent) {
        match event.event_type {
            EventType::Failed | EventType::ComponentFailed | EventType::NoComponentFound => {
                warn!(conversation = %event.conversation_id, "{}", event)
            }
            _ => info!(conversation = %event.conversation_id, "{}", event),
        }
    }
}
