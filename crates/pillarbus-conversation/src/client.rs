//! Client facade: starts and cancels conversations.

use crate::bus::MessageSender;
use crate::config::Settings;
use crate::context::{ContextBuilder, ConversationContext};
use crate::conversation::{Conversation, ConversationHandle};
use crate::error::Result;
use crate::event::EventHandler;
use crate::mediator::ConversationMediator;
use crate::operation::{ChecksumSpec, FileIdSelector, Operation};
use crate::types::CollectionId;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Entry point for callers. Holds the settings, the mediator the
/// conversations register with, the outbound sender and the default
/// event handler.
#[derive(Clone)]
pub struct Client {
    settings: Arc<Settings>,
    mediator: ConversationMediator,
    sender: Arc<dyn MessageSender>,
    event_handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.settings.client_id)
            .field("mediator", &self.mediator)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client. Fails if the settings do not validate.
    pub fn new(
        settings: Settings,
        mediator: ConversationMediator,
        sender: Arc<dyn MessageSender>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            mediator,
            sender,
            event_handler,
        })
    }

    /// The settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The mediator conversations register with.
    pub fn mediator(&self) -> &ConversationMediator {
        &self.mediator
    }

    /// Context builder pre-filled with this client's sender and event
    /// handler, for callers that need to narrow contributors or override
    /// policies before starting.
    pub fn context(&self, collection: CollectionId, operation: Operation) -> ContextBuilder<'_> {
        ConversationContext::builder(&self.settings, collection, operation)
            .sender(self.sender.clone())
            .event_handler(self.event_handler.clone())
    }

    /// Begin a conversation. Returns as soon as it is registered and
    /// running.
    pub fn start_operation(&self, context: ConversationContext) -> Result<ConversationHandle> {
        info!(
            conversation = %context.conversation_id(),
            operation = %context.operation_kind(),
            collection = %context.collection_id(),
            contributors = context.contributors().len(),
            "starting operation"
        );
        self.mediator.start(Conversation::new(context))
    }

    /// Cancel a conversation.
    pub fn cancel(&self, handle: &ConversationHandle) {
        handle.cancel();
    }

    fn start(&self, collection: &CollectionId, operation: Operation) -> Result<ConversationHandle> {
        let context = self.context(collection.clone(), operation).build()?;
        self.start_operation(context)
    }

    /// List file IDs on every contributor.
    pub fn get_file_ids(&self, collection: &CollectionId, file_ids: FileIdSelector) -> Result<ConversationHandle> {
        self.start(collection, Operation::GetFileIds { file_ids })
    }

    /// Fetch checksums from every contributor.
    pub fn get_checksums(
        &self,
        collection: &CollectionId,
        file_ids: FileIdSelector,
        checksum_spec: ChecksumSpec,
    ) -> Result<ConversationHandle> {
        self.start(
            collection,
            Operation::GetChecksums {
                file_ids,
                checksum_spec,
            },
        )
    }

    /// Retrieve a file from the fastest contributor and have it uploaded
    /// to `upload_url`.
    pub fn get_file(
        &self,
        collection: &CollectionId,
        file_id: impl Into<String>,
        upload_url: impl Into<String>,
    ) -> Result<ConversationHandle> {
        self.start(
            collection,
            Operation::GetFile {
                file_id: file_id.into(),
                upload_url: upload_url.into(),
            },
        )
    }

    /// Store a file on every contributor.
    pub fn put_file(
        &self,
        collection: &CollectionId,
        file_id: impl Into<String>,
        url: impl Into<String>,
        size: u64,
        checksum: Option<String>,
    ) -> Result<ConversationHandle> {
        self.start(
            collection,
            Operation::PutFile {
                file_id: file_id.into(),
                url: url.into(),
                size,
                checksum,
                return_checksum: None,
            },
        )
    }

    /// Delete a file from every contributor.
    pub fn delete_file(
        &self,
        collection: &CollectionId,
        file_id: impl Into<String>,
        checksum: Option<String>,
    ) -> Result<ConversationHandle> {
        self.start(
            collection,
            Operation::DeleteFile {
                file_id: file_id.into(),
                checksum,
                return_checksum: None,
            },
        )
    }

    /// Replace a file on every contributor.
    pub fn replace_file(
        &self,
        collection: &CollectionId,
        file_id: impl Into<String>,
        old_checksum: Option<String>,
        new_url: impl Into<String>,
        new_size: u64,
        new_checksum: Option<String>,
    ) -> Result<ConversationHandle> {
        self.start(
            collection,
            Operation::ReplaceFile {
                file_id: file_id.into(),
                old_checksum,
                new_url: new_url.into(),
                new_size,
                new_checksum,
            },
        )
    }

    /// Ask every contributor for its status.
    pub fn get_status(&self, collection: &CollectionId) -> Result<ConversationHandle> {
        self.start(collection, Operation::GetStatus)
    }

    /// Fetch audit trail events in a sequence range.
    pub fn get_audit_trails(
        &self,
        collection: &CollectionId,
        min_sequence: Option<u64>,
        max_sequence: Option<u64>,
        file_id: Option<String>,
    ) -> Result<ConversationHandle> {
        self.start(
            collection,
            Operation::GetAuditTrails {
                min_sequence,
                max_sequence,
                file_id,
            },
        )
    }
}
