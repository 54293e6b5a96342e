//! Conversation context: everything one conversation needs, fixed at
//! construction and shared read-only by all of its states.

use crate::bus::MessageSender;
use crate::config::Settings;
use crate::error::{ConversationError, Result};
use crate::event::{EventHandler, OperationEvent};
use crate::operation::{CompletionRule, Operation, OperationKind};
use crate::selector::{ComponentSelector, SelectionPolicy};
use crate::types::{CollectionId, ContributorId, ConversationId, Destination};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Audit information attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTrailInfo {
    /// Client that issued the request.
    pub client_id: String,
    /// Free text recorded in the contributors' audit trails.
    pub info: Option<String>,
}

/// Deadlines for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Identify phase.
    pub identification: Duration,
    /// Performing phase.
    pub operation: Duration,
    /// Whole conversation.
    pub conversation: Duration,
}

/// Immutable per-conversation context.
pub struct ConversationContext {
    conversation_id: ConversationId,
    collection_id: CollectionId,
    contributors: BTreeSet<ContributorId>,
    operation: Operation,
    selection: SelectionPolicy,
    completion: CompletionRule,
    client_id: ContributorId,
    reply_to: Destination,
    broadcast_to: Destination,
    timeouts: Timeouts,
    audit: AuditTrailInfo,
    sender: Arc<dyn MessageSender>,
    event_handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for ConversationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationContext")
            .field("conversation_id", &self.conversation_id)
            .field("collection_id", &self.collection_id)
            .field("contributors", &self.contributors)
            .field("operation", &self.operation)
            .field("selection", &self.selection)
            .field("completion", &self.completion)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl ConversationContext {
    /// Start building a context for `operation` on `collection_id`.
    pub fn builder(
        settings: &Settings,
        collection_id: CollectionId,
        operation: Operation,
    ) -> ContextBuilder<'_> {
        ContextBuilder {
            settings,
            collection_id,
            operation,
            contributors: None,
            selection: None,
            completion: None,
            audit_info: None,
            sender: None,
            event_handler: None,
        }
    }

    /// Conversation ID.
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Collection ID.
    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    /// Candidate contributors.
    pub fn contributors(&self) -> &BTreeSet<ContributorId> {
        &self.contributors
    }

    /// Operation and its parameters.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Operation type.
    pub fn operation_kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Selection policy.
    pub fn selection(&self) -> &SelectionPolicy {
        &self.selection
    }

    /// Completion rule.
    pub fn completion(&self) -> CompletionRule {
        self.completion
    }

    /// Sender ID put on outbound requests.
    pub fn client_id(&self) -> &ContributorId {
        &self.client_id
    }

    /// Where responses must be sent.
    pub fn reply_to(&self) -> &Destination {
        &self.reply_to
    }

    /// Topic the identify request is broadcast on.
    pub fn broadcast_to(&self) -> &Destination {
        &self.broadcast_to
    }

    /// Deadlines.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Audit information.
    pub fn audit(&self) -> &AuditTrailInfo {
        &self.audit
    }

    /// Outbound sender.
    pub fn sender(&self) -> &Arc<dyn MessageSender> {
        &self.sender
    }

    /// Hand an event to the caller's handler.
    pub fn emit(&self, event: OperationEvent) {
        self.event_handler.handle_event(event);
    }

    /// A fresh selector for the identify phase.
    pub fn new_selector(&self) -> Result<ComponentSelector> {
        ComponentSelector::new(self.selection.clone(), self.contributors.iter().cloned())
    }
}

/// Builder for [`ConversationContext`]. Validation happens in
/// [`ContextBuilder::build`]; nothing is constructed on failure.
pub struct ContextBuilder<'a> {
    settings: &'a Settings,
    collection_id: CollectionId,
    operation: Operation,
    contributors: Option<BTreeSet<ContributorId>>,
    selection: Option<SelectionPolicy>,
    completion: Option<CompletionRule>,
    audit_info: Option<String>,
    sender: Option<Arc<dyn MessageSender>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl<'a> ContextBuilder<'a> {
    /// Narrow the candidates to these contributors.
    pub fn contributors<I>(mut self, contributors: I) -> Self
    where
        I: IntoIterator<Item = ContributorId>,
    {
        self.contributors = Some(contributors.into_iter().collect());
        self
    }

    /// Override the selection policy.
    pub fn selection(mut self, policy: SelectionPolicy) -> Self {
        self.selection = Some(policy);
        self
    }

    /// Override the completion rule.
    pub fn completion(mut self, rule: CompletionRule) -> Self {
        self.completion = Some(rule);
        self
    }

    /// Free text for the contributors' audit trails.
    pub fn audit_info(mut self, info: impl Into<String>) -> Self {
        self.audit_info = Some(info.into());
        self
    }

    /// Outbound sender.
    pub fn sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Validate and build the context.
    pub fn build(self) -> Result<ConversationContext> {
        self.operation.validate()?;
        let collection = self.settings.collection(&self.collection_id).ok_or_else(|| {
            ConversationError::invalid(format!("unknown collection {}", self.collection_id))
        })?;
        let known: BTreeSet<ContributorId> = collection.contributors.iter().cloned().collect();

        let contributors = match self.contributors {
            Some(requested) => {
                if let Some(unknown) = requested.iter().find(|c| !known.contains(*c)) {
                    return Err(ConversationError::invalid(format!(
                        "contributor {unknown} is not part of collection {}",
                        self.collection_id
                    )));
                }
                requested
            }
            None => known,
        };
        if contributors.is_empty() {
            return Err(ConversationError::invalid(
                "a conversation needs at least one contributor",
            ));
        }

        let sender = self
            .sender
            .ok_or_else(|| ConversationError::invalid("no message sender configured"))?;
        let event_handler = self
            .event_handler
            .ok_or_else(|| ConversationError::invalid("no event handler configured"))?;

        let kind = self.operation.kind();
        let selection = self
            .selection
            .unwrap_or_else(|| self.settings.selection_for(kind));
        let completion = self
            .completion
            .unwrap_or_else(|| self.settings.completion_for(kind));

        // fail fast on a policy the candidates cannot satisfy
        ComponentSelector::new(selection.clone(), contributors.iter().cloned())?;

        Ok(ConversationContext {
            conversation_id: ConversationId::generate(),
            collection_id: self.collection_id,
            contributors,
            operation: self.operation,
            selection,
            completion,
            client_id: ContributorId::new(self.settings.client_id.clone()),
            reply_to: self.settings.reply_destination.clone(),
            broadcast_to: collection.destination.clone(),
            timeouts: Timeouts {
                identification: self.settings.identification_timeout(),
                operation: self.settings.operation_timeout(),
                conversation: self.settings.conversation_timeout(),
            },
            audit: AuditTrailInfo {
                client_id: self.settings.client_id.clone(),
                info: self.audit_info,
            },
            sender,
            event_handler,
        })
    }
}
