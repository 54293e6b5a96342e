//! Bus message schema: requests, responses, response codes and the
//! per-operation result payloads pillars return.
//!
//! Every message carries the conversation ID it belongs to; that is the
//! only field the mediator looks at when routing inbound traffic.

use crate::context::AuditTrailInfo;
use crate::error::{ConversationError, Result};
use crate::operation::{Operation, OperationKind};
use crate::types::{CollectionId, ContributorId, ConversationId, Destination};
use serde::{Deserialize, Serialize};

/// Status code a contributor puts in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Contributor can and will take part in the operation.
    IdentificationPositive,
    /// Contributor declines to take part.
    IdentificationNegative,
    /// Request accepted, more responses follow.
    OperationAcceptedProgress,
    /// Intermediate progress report.
    OperationProgress,
    /// The operation finished successfully at this contributor.
    OperationCompleted,
    /// The request could not be parsed by the contributor.
    RequestNotUnderstoodFailure,
    /// The contributor does not implement this operation.
    RequestNotSupported,
    /// The addressed file does not exist at this contributor.
    FileNotFoundFailure,
    /// The file already exists (put).
    DuplicateFileFailure,
    /// The checksum supplied for the existing file did not match.
    ExistingFileChecksumFailure,
    /// The checksum of the newly received file did not match.
    NewFileChecksumFailure,
    /// Transferring the file to or from the exchange failed.
    FileTransferFailure,
    /// Unspecified failure.
    Failure,
}

impl ResponseCode {
    /// True for the positive identify code.
    pub fn is_positive_identification(self) -> bool {
        self == ResponseCode::IdentificationPositive
    }

    /// True for codes announcing that more responses follow.
    pub fn is_progress(self) -> bool {
        matches!(
            self,
            ResponseCode::OperationAcceptedProgress | ResponseCode::OperationProgress
        )
    }

    /// True for the successful final code.
    pub fn is_completion(self) -> bool {
        self == ResponseCode::OperationCompleted
    }

    /// True for every code that signals a negative or error outcome.
    pub fn is_failure(self) -> bool {
        !(self.is_positive_identification() || self.is_progress() || self.is_completion())
    }
}

/// Status block of a response. Both fields are optional on the wire;
/// a response lacking either is malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// Response code.
    pub code: Option<ResponseCode>,
    /// Human readable explanation.
    pub text: Option<String>,
}

impl ResponseInfo {
    /// A well-formed status block.
    pub fn new(code: ResponseCode, text: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            text: Some(text.into()),
        }
    }

    /// Returns the explanation text, or an empty string.
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}

/// Extracts the response code from a status block, rejecting missing
/// status or missing code as [`ConversationError::MalformedResponse`].
pub fn response_code(from: &ContributorId, info: Option<&ResponseInfo>) -> Result<ResponseCode> {
    let info = info.ok_or_else(|| ConversationError::MalformedResponse {
        contributor: from.clone(),
        reason: "missing response info".to_string(),
    })?;
    info.code.ok_or_else(|| ConversationError::MalformedResponse {
        contributor: from.clone(),
        reason: "missing response code".to_string(),
    })
}

/// One file ID reported by a contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdEntry {
    /// File ID.
    pub file_id: String,
    /// File size in bytes, if reported.
    pub size: Option<u64>,
    /// Last modification time, milliseconds since the epoch.
    pub last_modified_ms: Option<u64>,
}

/// One checksum reported by a contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumEntry {
    /// File ID.
    pub file_id: String,
    /// Hex encoded checksum value.
    pub checksum: String,
    /// When the checksum was calculated, milliseconds since the epoch.
    pub calculated_at_ms: u64,
}

/// Status information a contributor reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Short machine readable status (e.g. "OK", "WARNING").
    pub status_code: String,
    /// Free text details.
    pub text: String,
    /// When the status was taken, milliseconds since the epoch.
    pub timestamp_ms: u64,
}

/// One audit-trail event kept by a contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Sequence number within the contributor's audit trail.
    pub sequence: u64,
    /// File the event concerns.
    pub file_id: Option<String>,
    /// Who performed the action.
    pub actor: String,
    /// What was done.
    pub action: String,
    /// Audit text supplied with the original request.
    pub info: Option<String>,
    /// When it happened, milliseconds since the epoch.
    pub timestamp_ms: u64,
}

/// Operation-specific payload of a successful final response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResult {
    /// File IDs matching the requested selection.
    FileIds(Vec<FileIdEntry>),
    /// Checksums for the requested files.
    Checksums(Vec<ChecksumEntry>),
    /// Where the retrieved file was uploaded.
    FileUploaded {
        /// Upload URL.
        url: String,
    },
    /// A file was stored (put or replace).
    FileStored {
        /// Checksum of the stored file, if requested.
        checksum: Option<String>,
    },
    /// A file was deleted.
    FileDeleted {
        /// Checksum of the deleted file, if requested.
        checksum: Option<String>,
    },
    /// Contributor status.
    Status(StatusInfo),
    /// Audit trail events.
    AuditTrails(Vec<AuditEvent>),
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Broadcast asking which contributors can perform the operation.
    IdentifyRequest {
        /// The operation to perform.
        operation: Operation,
        /// Audit information from the requesting client.
        audit: AuditTrailInfo,
    },
    /// A contributor's answer to an identify request.
    IdentifyResponse {
        /// Operation the answer refers to.
        operation: OperationKind,
        /// Status block.
        response: Option<ResponseInfo>,
    },
    /// Point-to-point request to perform the operation.
    OperationRequest {
        /// The operation to perform.
        operation: Operation,
        /// Audit information from the requesting client.
        audit: AuditTrailInfo,
    },
    /// Progress or final answer to an operation request.
    OperationResponse {
        /// Operation the answer refers to.
        operation: OperationKind,
        /// Status block.
        response: Option<ResponseInfo>,
        /// Result payload, present on successful final responses.
        result: Option<OperationResult>,
    },
}

/// Envelope for everything sent on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Collection the operation addresses.
    pub collection_id: CollectionId,
    /// Sender identity (a contributor or the requesting client).
    pub from: ContributorId,
    /// Where replies to this message go.
    pub reply_to: Destination,
    /// Payload.
    pub body: MessageBody,
}

impl Message {
    /// Build the reply to `request`, addressed to the same conversation.
    pub fn reply_to(
        request: &Message,
        from: ContributorId,
        reply_to: Destination,
        body: MessageBody,
    ) -> Self {
        Self {
            conversation_id: request.conversation_id,
            collection_id: request.collection_id.clone(),
            from,
            reply_to,
            body,
        }
    }

    /// Short name of the payload, for logging.
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::IdentifyRequest { .. } => "IdentifyRequest",
            MessageBody::IdentifyResponse { .. } => "IdentifyResponse",
            MessageBody::OperationRequest { .. } => "OperationRequest",
            MessageBody::OperationResponse { .. } => "OperationResponse",
        }
    }

    /// True for responses (the only messages a client conversation consumes).
    pub fn is_response(&self) -> bool {
        matches!(
            self.body,
            MessageBody::IdentifyResponse { .. } | MessageBody::OperationResponse { .. }
        )
    }

    /// Encode for a byte transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a frame produced by [`Message::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify_response(code: Option<ResponseCode>) -> Message {
        Message {
            conversation_id: ConversationId::generate(),
            collection_id: CollectionId::new("books"),
            from: ContributorId::new("pillar-a"),
            reply_to: Destination::new("queue.pillar-a"),
            body: MessageBody::IdentifyResponse {
                operation: OperationKind::GetFileIds,
                response: Some(ResponseInfo {
                    code,
                    text: Some("ok".to_string()),
                }),
            },
        }
    }

    #[test]
    fn test_response_code_classification() {
        assert!(ResponseCode::IdentificationPositive.is_positive_identification());
        assert!(!ResponseCode::IdentificationPositive.is_failure());
        assert!(ResponseCode::IdentificationNegative.is_failure());
        assert!(ResponseCode::OperationAcceptedProgress.is_progress());
        assert!(ResponseCode::OperationProgress.is_progress());
        assert!(ResponseCode::OperationCompleted.is_completion());
        assert!(ResponseCode::FileNotFoundFailure.is_failure());
        assert!(ResponseCode::Failure.is_failure());
    }

    #[test]
    fn test_response_code_missing_info_is_malformed() {
        let from = ContributorId::new("pillar-a");
        let err = response_code(&from, None).unwrap_err();
        assert!(matches!(err, ConversationError::MalformedResponse { .. }));
    }

    #[test]
    fn test_response_code_missing_code_is_malformed() {
        let from = ContributorId::new("pillar-a");
        let info = ResponseInfo {
            code: None,
            text: Some("?".to_string()),
        };
        let err = response_code(&from, Some(&info)).unwrap_err();
        match err {
            ConversationError::MalformedResponse { contributor, reason } => {
                assert_eq!(contributor, from);
                assert!(reason.contains("code"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_encode_decode_preserves_message() {
        let msg = identify_response(Some(ResponseCode::IdentificationPositive));
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = Message::decode(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, ConversationError::Serialization(_)));
    }

    #[test]
    fn test_reply_keeps_conversation() {
        let request = identify_response(None);
        let reply = Message::reply_to(
            &request,
            ContributorId::new("pillar-b"),
            Destination::new("queue.pillar-b"),
            MessageBody::IdentifyResponse {
                operation: OperationKind::GetStatus,
                response: None,
            },
        );
        assert_eq!(reply.conversation_id, request.conversation_id);
        assert_eq!(reply.collection_id, request.collection_id);
        assert_eq!(reply.kind(), "IdentifyResponse");
        assert!(reply.is_response());
    }
}
