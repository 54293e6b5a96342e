#![warn(missing_docs)]

//! Pillarbus conversation engine: coordinates file-preservation operations
//! across independent storage pillars reachable only through a
//! publish/subscribe message bus.
//!
//! A conversation broadcasts an identify request, selects pillars from the
//! answers according to a [`SelectionPolicy`], sends the operation request
//! to the selected pillars and aggregates their results into a stream of
//! [`OperationEvent`]s and a final [`ConversationOutcome`]. The
//! [`ConversationMediator`] routes inbound traffic to running
//! conversations by [`ConversationId`].

pub mod bus;
pub mod client;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod event;
pub mod mediator;
pub mod message;
pub mod operation;
pub mod selector;
pub mod state;
pub mod tracker;
pub mod types;

pub use bus::{LocalBus, LocalBusStats, MessageSender};
pub use client::Client;
pub use config::{CollectionSettings, OperationPolicy, Settings};
pub use context::{AuditTrailInfo, ContextBuilder, ConversationContext, Timeouts};
pub use conversation::{Conversation, ConversationHandle};
pub use error::{ConversationError, Result, TransportError};
pub use event::{
    ChannelEventHandler, EventHandler, EventType, FailureReason, LoggingEventHandler,
    OperationEvent,
};
pub use mediator::ConversationMediator;
pub use message::{
    AuditEvent, ChecksumEntry, FileIdEntry, Message, MessageBody, OperationResult, ResponseCode,
    ResponseInfo, StatusInfo,
};
pub use operation::{
    ChecksumAlgorithm, ChecksumSpec, CompletionRule, FileIdSelector, Operation, OperationKind,
};
pub use selector::{ComponentSelector, Offer, SelectionPolicy};
pub use state::{ContributorStatus, ConversationOutcome, ConversationState, Effect, Input, Phase};
pub use tracker::ResponseTracker;
pub use types::{CollectionId, Contributor, ContributorId, ConversationId, Destination};
