//! Client settings: timeouts, collections and per-operation policy overrides.

use crate::error::{ConversationError, Result};
use crate::operation::{CompletionRule, OperationKind};
use crate::selector::SelectionPolicy;
use crate::types::{CollectionId, ContributorId, Destination};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// One collection: its broadcast topic and the contributors serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// Collection ID.
    pub id: CollectionId,
    /// Topic identify requests for this collection are broadcast on.
    pub destination: Destination,
    /// Contributors (pillars) serving the collection.
    pub contributors: Vec<ContributorId>,
}

/// Override of the built-in defaults for one operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// Operation the override applies to.
    pub operation: OperationKind,
    /// Selection policy override.
    #[serde(default)]
    pub selection: Option<SelectionPolicy>,
    /// Completion rule override.
    #[serde(default)]
    pub completion: Option<CompletionRule>,
}

/// Read-only client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ID this client uses as sender on outbound requests.
    pub client_id: String,
    /// Queue responses to this client are delivered to.
    pub reply_destination: Destination,
    /// How long the identify phase waits for selection to complete.
    pub identification_timeout_ms: u64,
    /// How long the performing phase waits for contributors to finish.
    pub operation_timeout_ms: u64,
    /// Ceiling for a whole conversation, regardless of phase.
    pub conversation_timeout_ms: u64,
    /// Known collections.
    pub collections: Vec<CollectionSettings>,
    /// Per-operation overrides.
    pub policies: Vec<OperationPolicy>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::from("pillarbus-client"),
            reply_destination: Destination::new("queue.pillarbus-client"),
            identification_timeout_ms: 10_000,
            operation_timeout_ms: 3_600_000,
            conversation_timeout_ms: 7_200_000,
            collections: Vec::new(),
            policies: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from a `.toml` or `.json` file and validate them.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let settings: Settings = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported settings file extension: {}", ext),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings a conversation cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(config_error("client_id must not be empty"));
        }
        for (name, value) in [
            ("identification_timeout_ms", self.identification_timeout_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("conversation_timeout_ms", self.conversation_timeout_ms),
        ] {
            if value == 0 {
                return Err(config_error(format!("{name} must be greater than zero")));
            }
        }
        let mut seen = BTreeSet::new();
        for collection in &self.collections {
            if !seen.insert(&collection.id) {
                return Err(config_error(format!(
                    "collection {} is configured twice",
                    collection.id
                )));
            }
            if collection.contributors.is_empty() {
                return Err(config_error(format!(
                    "collection {} has no contributors",
                    collection.id
                )));
            }
        }
        let mut overridden = BTreeSet::new();
        for policy in &self.policies {
            if !overridden.insert(policy.operation) {
                return Err(config_error(format!(
                    "operation {} has more than one policy",
                    policy.operation
                )));
            }
        }
        Ok(())
    }

    /// Look up a collection.
    pub fn collection(&self, id: &CollectionId) -> Option<&CollectionSettings> {
        self.collections.iter().find(|c| &c.id == id)
    }

    /// Selection policy for an operation type.
    pub fn selection_for(&self, kind: OperationKind) -> SelectionPolicy {
        self.policy(kind)
            .and_then(|p| p.selection.clone())
            .unwrap_or_else(|| kind.default_selection())
    }

    /// Completion rule for an operation type.
    pub fn completion_for(&self, kind: OperationKind) -> CompletionRule {
        self.policy(kind)
            .and_then(|p| p.completion)
            .unwrap_or_else(|| kind.default_completion())
    }

    /// Identify phase timeout.
    pub fn identification_timeout(&self) -> Duration {
        Duration::from_millis(self.identification_timeout_ms)
    }

    /// Performing phase timeout.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Whole-conversation ceiling.
    pub fn conversation_timeout(&self) -> Duration {
        Duration::from_millis(self.conversation_timeout_ms)
    }

    fn policy(&self, kind: OperationKind) -> Option<&OperationPolicy> {
        self.policies.iter().find(|p| p.operation == kind)
    }
}

fn config_error(msg: impl Into<String>) -> ConversationError {
    ConversationError::Config { msg: msg.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn collection(id: &str, contributors: &[&str]) -> CollectionSettings {
        CollectionSettings {
            id: CollectionId::new(id),
            destination: Destination::new(format!("topic.{id}")),
            contributors: contributors.iter().map(|c| ContributorId::new(*c)).collect(),
        }
    }

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.identification_timeout(), Duration::from_secs(10));
        assert_eq!(settings.operation_timeout(), Duration::from_secs(3600));
        assert_eq!(settings.conversation_timeout(), Duration::from_secs(7200));
        assert!(settings.collections.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_policy_defaults_and_overrides() {
        let settings = Settings {
            policies: vec![OperationPolicy {
                operation: OperationKind::GetStatus,
                selection: Some(SelectionPolicy::FirstPositive(2)),
                completion: Some(CompletionRule::RequireAll),
            }],
            ..Settings::default()
        };
        assert_eq!(
            settings.selection_for(OperationKind::GetStatus),
            SelectionPolicy::FirstPositive(2)
        );
        assert_eq!(
            settings.completion_for(OperationKind::GetStatus),
            CompletionRule::RequireAll
        );
        assert_eq!(
            settings.completion_for(OperationKind::GetFile),
            CompletionRule::RequireAny
        );
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let settings = Settings {
            identification_timeout_ms: 0,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConversationError::Config { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_collection() {
        let settings = Settings {
            collections: vec![collection("books", &["a"]), collection("books", &["b"])],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_collection() {
        let settings = Settings {
            collections: vec![collection("books", &[])],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_policy() {
        let policy = OperationPolicy {
            operation: OperationKind::PutFile,
            selection: None,
            completion: None,
        };
        let settings = Settings {
            policies: vec![policy.clone(), policy],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_collection_lookup() {
        let settings = Settings {
            collections: vec![collection("books", &["a", "b"])],
            ..Settings::default()
        };
        let books = settings.collection(&CollectionId::new("books")).unwrap();
        assert_eq!(books.contributors.len(), 2);
        assert!(settings.collection(&CollectionId::new("films")).is_none());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
client_id = "integrity-service"
reply_destination = "queue.integrity"
identification_timeout_ms = 2000

[[collections]]
id = "books"
destination = "topic.books"
contributors = ["pillar-a", "pillar-b"]

[[policies]]
operation = "get_status"
selection = {{ first_positive = 1 }}
completion = "require_any"
            "#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.client_id, "integrity-service");
        assert_eq!(settings.identification_timeout_ms, 2000);
        assert_eq!(settings.operation_timeout_ms, 3_600_000);
        assert_eq!(settings.collections.len(), 1);
        assert_eq!(
            settings.selection_for(OperationKind::GetStatus),
            SelectionPolicy::FirstPositive(1)
        );
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "client_id": "cli",
                "collections": [
                    {{"id": "films", "destination": "topic.films", "contributors": ["p1"]}}
                ],
                "policies": [
                    {{"operation": "put_file", "selection": "all_components", "completion": "require_any"}}
                ]
            }}"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.client_id, "cli");
        assert_eq!(
            settings.completion_for(OperationKind::PutFile),
            CompletionRule::RequireAny
        );
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(Settings::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_rejects_invalid_settings() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "conversation_timeout_ms = 0").unwrap();
        assert!(Settings::from_file(file.path()).is_err());
    }
}
