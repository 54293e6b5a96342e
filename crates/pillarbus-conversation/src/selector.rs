//! Component selection: deciding which identified contributors take part
//! in the operation, and when enough of them have answered.

use crate::error::{ConversationError, Result};
use crate::message::{response_code, Message, MessageBody};
use crate::tracker::ResponseTracker;
use crate::types::{Contributor, ContributorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Rule deciding how many (and which) positive identify responses are
/// enough to proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Every candidate must answer.
    AllComponents,
    /// Done after this many positive answers (or when everyone answered).
    FirstPositive(usize),
    /// Only the named contributors count, and only they are selected.
    SpecificComponents(BTreeSet<ContributorId>),
}

/// What happened to an accepted (non-error) identify response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// The contributor was appended to the selection.
    Selected(Contributor),
    /// The contributor already answered; its first answer stands.
    Duplicate,
    /// Recorded, but not eligible for selection.
    Ignored {
        /// Why it was not selected.
        reason: &'static str,
    },
}

/// Consumes identify responses and builds the selection for one
/// conversation according to its [`SelectionPolicy`].
#[derive(Debug, Clone)]
pub struct ComponentSelector {
    policy: SelectionPolicy,
    tracker: ResponseTracker,
    selected: Vec<Contributor>,
    rejected: BTreeSet<ContributorId>,
}

impl ComponentSelector {
    /// Create a selector over the candidate contributors.
    pub fn new<I>(policy: SelectionPolicy, candidates: I) -> Result<Self>
    where
        I: IntoIterator<Item = ContributorId>,
    {
        let tracker = ResponseTracker::new(candidates)?;
        match &policy {
            SelectionPolicy::AllComponents => {}
            SelectionPolicy::FirstPositive(0) => {
                return Err(ConversationError::invalid(
                    "first-positive selection needs a count of at least one",
                ));
            }
            SelectionPolicy::FirstPositive(_) => {}
            SelectionPolicy::SpecificComponents(required) => {
                if required.is_empty() {
                    return Err(ConversationError::invalid(
                        "specific-component selection needs at least one contributor",
                    ));
                }
                if let Some(unknown) = required.iter().find(|r| !tracker.is_expected(r)) {
                    return Err(ConversationError::invalid(format!(
                        "required contributor {unknown} is not a candidate"
                    )));
                }
            }
        }
        Ok(Self {
            policy,
            tracker,
            selected: Vec::new(),
            rejected: BTreeSet::new(),
        })
    }

    /// Offer an identify response.
    ///
    /// Malformed responses are rejected without touching the tracker.
    /// A contributor's first well-formed answer is final: repeats and
    /// contradicting answers come back as [`Offer::Duplicate`]. Answers
    /// from outside the candidate set are recorded and ignored. A first
    /// negative answer from a candidate advances the tracker and comes
    /// back as [`ConversationError::NegativeResponse`]; the selection is
    /// unchanged.
    pub fn offer(&mut self, response: &Message) -> Result<Offer> {
        let from = &response.from;
        let info = match &response.body {
            MessageBody::IdentifyResponse { response, .. } => response.as_ref(),
            _ => {
                return Err(ConversationError::MalformedResponse {
                    contributor: from.clone(),
                    reason: format!("expected IdentifyResponse, got {}", response.kind()),
                });
            }
        };
        let code = response_code(from, info)?;
        if !self.tracker.is_expected(from) {
            self.tracker.record_response(from);
            return Ok(Offer::Ignored {
                reason: "not a candidate contributor",
            });
        }
        if self.tracker.has_responded(from) {
            return Ok(Offer::Duplicate);
        }
        let was_done = self.is_selection_done();
        self.tracker.record_response(from);

        if !code.is_positive_identification() {
            self.rejected.insert(from.clone());
            return Err(ConversationError::NegativeResponse {
                contributor: from.clone(),
                code,
                text: info.map(|i| i.text().to_string()).unwrap_or_default(),
            });
        }
        if was_done {
            return Ok(Offer::Ignored {
                reason: "selection already complete",
            });
        }
        if let SelectionPolicy::SpecificComponents(required) = &self.policy {
            if !required.contains(from) {
                return Ok(Offer::Ignored {
                    reason: "not a required contributor",
                });
            }
        }

        let contributor = Contributor::new(from.clone(), response.reply_to.clone());
        self.selected.push(contributor.clone());
        Ok(Offer::Selected(contributor))
    }

    /// True once the policy's counting rule is met.
    pub fn is_selection_done(&self) -> bool {
        match &self.policy {
            SelectionPolicy::AllComponents => self.tracker.is_finished(),
            SelectionPolicy::FirstPositive(n) => {
                self.selected.len() >= *n || self.tracker.is_finished()
            }
            SelectionPolicy::SpecificComponents(required) => {
                required.iter().all(|r| self.tracker.has_responded(r))
            }
        }
    }

    /// The contributors selected so far, in the order they were accepted.
    pub fn selected(&self) -> &[Contributor] {
        &self.selected
    }

    /// Consume the selector, returning the frozen selection.
    pub fn into_selection(self) -> Vec<Contributor> {
        self.selected
    }

    /// Contributors that answered negatively.
    pub fn rejected(&self) -> &BTreeSet<ContributorId> {
        &self.rejected
    }

    /// Candidates that have not answered at all.
    pub fn outstanding(&self) -> BTreeSet<ContributorId> {
        self.tracker.outstanding()
    }

    /// The policy this selector applies.
    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }
}
