//! Routes inbound messages to the conversation they belong to.
//!
//! The mediator is an explicitly constructed registry of running
//! conversations keyed by [`ConversationId`]. It is cheap to clone; all
//! clones share one table. Dispatch never blocks: each conversation has
//! an unbounded inbox drained by its own task.

use crate::conversation::{Conversation, ConversationHandle};
use crate::error::{ConversationError, Result};
use crate::message::Message;
use crate::state::{ConversationState, Input};
use crate::types::ConversationId;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Registry of live conversations.
#[derive(Clone, Default)]
pub struct ConversationMediator {
    conversations: Arc<DashMap<ConversationId, mpsc::UnboundedSender<Input>>>,
}

impl fmt::Debug for ConversationMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationMediator")
            .field("active", &self.conversations.len())
            .finish()
    }
}

impl ConversationMediator {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation: register it, then spawn its driver.
    ///
    /// Registration happens before the identify broadcast goes out, so no
    /// response can arrive for an unregistered conversation.
    pub fn start(&self, conversation: Conversation) -> Result<ConversationHandle> {
        let id = conversation.id();
        let initial = ConversationState::start(conversation.context())?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(id, tx.clone())?;
        debug!(conversation = %id, "conversation registered");
        Ok(conversation.spawn(initial, tx, rx, self.clone()))
    }

    /// Register an inbox under `id`.
    pub fn register(&self, id: ConversationId, inbox: mpsc::UnboundedSender<Input>) -> Result<()> {
        match self.conversations.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConversationError::DuplicateConversation { id })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(inbox);
                Ok(())
            }
        }
    }

    /// Remove a conversation. Removing an unknown ID is a no-op.
    pub fn deregister(&self, id: &ConversationId) {
        if self.conversations.remove(id).is_some() {
            debug!(conversation = %id, "conversation deregistered");
        }
    }

    /// Route one inbound message. Messages for unknown or finished
    /// conversations are logged and dropped.
    pub fn dispatch(&self, message: Message) {
        if !message.is_response() {
            debug!(
                conversation = %message.conversation_id,
                kind = message.kind(),
                "ignoring non-response message"
            );
            return;
        }
        let id = message.conversation_id;
        let delivered = match self.conversations.get(&id) {
            Some(inbox) => inbox.send(Input::Message(message)).is_ok(),
            None => {
                debug!(conversation = %id, from = %message.from, "no conversation for message, dropping");
                return;
            }
        };
        if !delivered {
            debug!(conversation = %id, "conversation stopped, dropping message");
            self.deregister(&id);
        }
    }

    /// Decode a bincode frame and dispatch it. Undecodable frames are
    /// dropped.
    pub fn dispatch_bytes(&self, frame: &[u8]) {
        match Message::decode(frame) {
            Ok(message) => self.dispatch(message),
            Err(e) => warn!(len = frame.len(), error = %e, "dropping undecodable frame"),
        }
    }

    /// Deliver an input to a registered conversation.
    pub fn deliver(&self, id: &ConversationId, input: Input) -> Result<()> {
        let inbox = self
            .conversations
            .get(id)
            .ok_or(ConversationError::UnknownConversation { id: *id })?;
        inbox
            .send(input)
            .map_err(|_| ConversationError::UnknownConversation { id: *id })
    }

    /// Cancel a registered conversation.
    pub fn cancel(&self, id: &ConversationId) -> Result<()> {
        self.deliver(id, Input::Cancel)
    }

    /// Pump a bus subscription into [`ConversationMediator::dispatch`]
    /// until the subscription closes.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Message>) {
        info!("mediator dispatch loop started");
        while let Some(message) = inbound.recv().await {
            self.dispatch(message);
        }
        info!(active = self.active_count(), "mediator dispatch loop stopped");
    }

    /// Cancel every live conversation. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<ConversationId> = self.conversations.iter().map(|e| *e.key()).collect();
        let cancelled = ids.iter().filter(|id| self.cancel(id).is_ok()).count();
        info!(cancelled, "mediator shutdown");
        cancelled
    }

    /// Number of registered conversations.
    pub fn active_count(&self) -> usize {
        self.conversations.len()
    }

    /// True if `id` is registered.
    pub fn is_registered(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }
}
