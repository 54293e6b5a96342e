//! Operation catalogue: the preservation operations a conversation can
//! drive, their parameters, and the per-operation defaults for
//! contributor selection and overall success.

use crate::error::{ConversationError, Result};
use crate::selector::SelectionPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation type, without parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// List file IDs.
    GetFileIds,
    /// Fetch checksums.
    GetChecksums,
    /// Retrieve one file from any contributor.
    GetFile,
    /// Store a new file.
    PutFile,
    /// Delete a file.
    DeleteFile,
    /// Replace an existing file with new content.
    ReplaceFile,
    /// Ask contributors for their status.
    GetStatus,
    /// Fetch audit trail events.
    GetAuditTrails,
}

impl OperationKind {
    /// All operation kinds.
    pub const ALL: [OperationKind; 8] = [
        OperationKind::GetFileIds,
        OperationKind::GetChecksums,
        OperationKind::GetFile,
        OperationKind::PutFile,
        OperationKind::DeleteFile,
        OperationKind::ReplaceFile,
        OperationKind::GetStatus,
        OperationKind::GetAuditTrails,
    ];

    /// Selection policy used unless settings override it.
    pub fn default_selection(self) -> SelectionPolicy {
        match self {
            OperationKind::GetFile => SelectionPolicy::FirstPositive(1),
            _ => SelectionPolicy::AllComponents,
        }
    }

    /// Completion rule used unless settings override it.
    pub fn default_completion(self) -> CompletionRule {
        match self {
            OperationKind::GetFile | OperationKind::GetStatus | OperationKind::GetAuditTrails => {
                CompletionRule::RequireAny
            }
            OperationKind::GetFileIds
            | OperationKind::GetChecksums
            | OperationKind::PutFile
            | OperationKind::DeleteFile
            | OperationKind::ReplaceFile => CompletionRule::RequireAll,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::GetFileIds => "GetFileIDs",
            OperationKind::GetChecksums => "GetChecksums",
            OperationKind::GetFile => "GetFile",
            OperationKind::PutFile => "PutFile",
            OperationKind::DeleteFile => "DeleteFile",
            OperationKind::ReplaceFile => "ReplaceFile",
            OperationKind::GetStatus => "GetStatus",
            OperationKind::GetAuditTrails => "GetAuditTrails",
        };
        f.write_str(name)
    }
}

/// How many selected contributors must complete for the operation to
/// succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionRule {
    /// Every selected contributor must complete.
    RequireAll,
    /// One completed contributor is enough.
    RequireAny,
}

impl CompletionRule {
    /// Decide overall success once every contributor reached a terminal status.
    pub fn is_success(self, completed: usize, selected: usize) -> bool {
        match self {
            CompletionRule::RequireAll => selected > 0 && completed == selected,
            CompletionRule::RequireAny => completed > 0,
        }
    }
}

/// Which files an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileIdSelector {
    /// Every file in the collection.
    All,
    /// The listed files.
    Ids(Vec<String>),
}

/// Checksum algorithms a contributor may be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    /// MD5.
    Md5,
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
    /// HMAC-SHA-256, requires a salt.
    HmacSha256,
}

/// Checksum request: algorithm plus optional salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    /// Algorithm to use.
    pub algorithm: ChecksumAlgorithm,
    /// Hex encoded salt for salted algorithms.
    pub salt: Option<String>,
}

impl ChecksumSpec {
    /// Unsalted checksum with the given algorithm.
    pub fn plain(algorithm: ChecksumAlgorithm) -> Self {
        Self {
            algorithm,
            salt: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.algorithm == ChecksumAlgorithm::HmacSha256 && self.salt.is_none() {
            return Err(ConversationError::invalid("HMAC checksums need a salt"));
        }
        Ok(())
    }
}

/// An operation with its operation-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// List file IDs.
    GetFileIds {
        /// Files to list.
        file_ids: FileIdSelector,
    },
    /// Fetch checksums.
    GetChecksums {
        /// Files to checksum.
        file_ids: FileIdSelector,
        /// Checksum to calculate.
        checksum_spec: ChecksumSpec,
    },
    /// Retrieve one file.
    GetFile {
        /// File to retrieve.
        file_id: String,
        /// Where the contributor should upload it.
        upload_url: String,
    },
    /// Store a new file.
    PutFile {
        /// File ID to store under.
        file_id: String,
        /// Where contributors download the content from.
        url: String,
        /// Size in bytes.
        size: u64,
        /// Expected checksum of the content.
        checksum: Option<String>,
        /// Checksum contributors should return after storing.
        return_checksum: Option<ChecksumSpec>,
    },
    /// Delete a file.
    DeleteFile {
        /// File to delete.
        file_id: String,
        /// Checksum of the existing file, as proof of intent.
        checksum: Option<String>,
        /// Checksum contributors should return before deleting.
        return_checksum: Option<ChecksumSpec>,
    },
    /// Replace a file.
    ReplaceFile {
        /// File to replace.
        file_id: String,
        /// Checksum of the existing file.
        old_checksum: Option<String>,
        /// Where contributors download the new content from.
        new_url: String,
        /// Size of the new content in bytes.
        new_size: u64,
        /// Expected checksum of the new content.
        new_checksum: Option<String>,
    },
    /// Ask for contributor status.
    GetStatus,
    /// Fetch audit trail events.
    GetAuditTrails {
        /// Lowest sequence number to return.
        min_sequence: Option<u64>,
        /// Highest sequence number to return.
        max_sequence: Option<u64>,
        /// Only events for this file.
        file_id: Option<String>,
    },
}

impl Operation {
    /// The parameterless operation type.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::GetFileIds { .. } => OperationKind::GetFileIds,
            Operation::GetChecksums { .. } => OperationKind::GetChecksums,
            Operation::GetFile { .. } => OperationKind::GetFile,
            Operation::PutFile { .. } => OperationKind::PutFile,
            Operation::DeleteFile { .. } => OperationKind::DeleteFile,
            Operation::ReplaceFile { .. } => OperationKind::ReplaceFile,
            Operation::GetStatus => OperationKind::GetStatus,
            Operation::GetAuditTrails { .. } => OperationKind::GetAuditTrails,
        }
    }

    /// The single file an operation addresses, if any.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            Operation::GetFile { file_id, .. }
            | Operation::PutFile { file_id, .. }
            | Operation::DeleteFile { file_id, .. }
            | Operation::ReplaceFile { file_id, .. } => Some(file_id.as_str()),
            Operation::GetAuditTrails { file_id, .. } => file_id.as_deref(),
            _ => None,
        }
    }

    /// Check the parameters before a conversation is built from them.
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::GetFileIds { file_ids } => validate_selector(file_ids),
            Operation::GetChecksums {
                file_ids,
                checksum_spec,
            } => {
                validate_selector(file_ids)?;
                checksum_spec.validate()
            }
            Operation::GetFile {
                file_id,
                upload_url,
            } => {
                require_non_empty("file_id", file_id)?;
                require_non_empty("upload_url", upload_url)
            }
            Operation::PutFile {
                file_id,
                url,
                return_checksum,
                ..
            } => {
                require_non_empty("file_id", file_id)?;
                require_non_empty("url", url)?;
                return_checksum.as_ref().map_or(Ok(()), ChecksumSpec::validate)
            }
            Operation::DeleteFile {
                file_id,
                return_checksum,
                ..
            } => {
                require_non_empty("file_id", file_id)?;
                return_checksum.as_ref().map_or(Ok(()), ChecksumSpec::validate)
            }
            Operation::ReplaceFile {
                file_id, new_url, ..
            } => {
                require_non_empty("file_id", file_id)?;
                require_non_empty("new_url", new_url)
            }
            Operation::GetStatus => Ok(()),
            Operation::GetAuditTrails {
                min_sequence,
                max_sequence,
                ..
            } => match (min_sequence, max_sequence) {
                (Some(min), Some(max)) if min > max => Err(ConversationError::invalid(format!(
                    "audit trail range is empty: {min} > {max}"
                ))),
                _ => Ok(()),
            },
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConversationError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_selector(selector: &FileIdSelector) -> Result<()> {
    match selector {
        FileIdSelector::All => Ok(()),
        FileIdSelector::Ids(ids) if ids.is_empty() => {
            Err(ConversationError::invalid("file ID list must not be empty"))
        }
        FileIdSelector::Ids(ids) => ids.iter().try_for_each(|id| require_non_empty("file_id", id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_file_selects_first_positive() {
        assert_eq!(
            OperationKind::GetFile.default_selection(),
            SelectionPolicy::FirstPositive(1)
        );
        assert_eq!(
            OperationKind::GetFile.default_completion(),
            CompletionRule::RequireAny
        );
    }

    #[test]
    fn test_mutating_operations_require_all() {
        for kind in [
            OperationKind::PutFile,
            OperationKind::DeleteFile,
            OperationKind::ReplaceFile,
        ] {
            assert_eq!(kind.default_selection(), SelectionPolicy::AllComponents);
            assert_eq!(kind.default_completion(), CompletionRule::RequireAll);
        }
    }

    #[test]
    fn test_completion_rules() {
        assert!(CompletionRule::RequireAll.is_success(3, 3));
        assert!(!CompletionRule::RequireAll.is_success(2, 3));
        assert!(!CompletionRule::RequireAll.is_success(0, 0));
        assert!(CompletionRule::RequireAny.is_success(1, 3));
        assert!(!CompletionRule::RequireAny.is_success(0, 3));
    }

    #[test]
    fn test_kind_matches_operation() {
        let op = Operation::DeleteFile {
            file_id: "f1".to_string(),
            checksum: None,
            return_checksum: None,
        };
        assert_eq!(op.kind(), OperationKind::DeleteFile);
        assert_eq!(op.file_id(), Some("f1"));
        assert_eq!(Operation::GetStatus.file_id(), None);
    }

    #[test]
    fn test_validate_rejects_empty_file_id() {
        let op = Operation::GetFile {
            file_id: " ".to_string(),
            upload_url: "http://exchange/f".to_string(),
        };
        assert!(matches!(
            op.validate(),
            Err(ConversationError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_id_list() {
        let op = Operation::GetFileIds {
            file_ids: FileIdSelector::Ids(vec![]),
        };
        assert!(op.validate().is_err());
        let op = Operation::GetFileIds {
            file_ids: FileIdSelector::All,
        };
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_validate_hmac_needs_salt() {
        let op = Operation::GetChecksums {
            file_ids: FileIdSelector::All,
            checksum_spec: ChecksumSpec::plain(ChecksumAlgorithm::HmacSha256),
        };
        assert!(op.validate().is_err());
        let op = Operation::GetChecksums {
            file_ids: FileIdSelector::All,
            checksum_spec: ChecksumSpec {
                algorithm: ChecksumAlgorithm::HmacSha256,
                salt: Some("abcd".to_string()),
            },
        };
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_validate_audit_range() {
        let op = Operation::GetAuditTrails {
            min_sequence: Some(10),
            max_sequence: Some(2),
            file_id: None,
        };
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(OperationKind::GetFileIds.to_string(), "GetFileIDs");
        assert_eq!(OperationKind::ALL.len(), 8);
    }
}
