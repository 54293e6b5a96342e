//! Response tracking: which expected contributors have answered a request.

use crate::error::{ConversationError, Result};
use crate::types::ContributorId;
use std::collections::BTreeSet;

/// Records which of a fixed set of expected contributors have responded.
///
/// Recording is idempotent and never fails: late, duplicate and
/// unexpected responses are accepted but only responses from expected
/// contributors move the tracker towards [`ResponseTracker::is_finished`].
#[derive(Debug, Clone)]
pub struct ResponseTracker {
    expected: BTreeSet<ContributorId>,
    responded: BTreeSet<ContributorId>,
}

impl ResponseTracker {
    /// Create a tracker for a non-empty set of expected contributors.
    pub fn new<I>(expected: I) -> Result<Self>
    where
        I: IntoIterator<Item = ContributorId>,
    {
        let expected: BTreeSet<ContributorId> = expected.into_iter().collect();
        if expected.is_empty() {
            return Err(ConversationError::invalid(
                "response tracker needs at least one expected contributor",
            ));
        }
        Ok(Self {
            expected,
            responded: BTreeSet::new(),
        })
    }

    /// Mark `id` as having responded.
    pub fn record_response(&mut self, id: &ContributorId) {
        self.responded.insert(id.clone());
    }

    /// True once every expected contributor has responded.
    pub fn is_finished(&self) -> bool {
        self.expected.is_subset(&self.responded)
    }

    /// Expected contributors that have not responded yet.
    pub fn outstanding(&self) -> BTreeSet<ContributorId> {
        self.expected.difference(&self.responded).cloned().collect()
    }

    /// True if `id` has responded at least once.
    pub fn has_responded(&self, id: &ContributorId) -> bool {
        self.responded.contains(id)
    }

    /// True if `id` is one of the expected contributors.
    pub fn is_expected(&self, id: &ContributorId) -> bool {
        self.expected.contains(id)
    }

    /// The expected contributors.
    pub fn expected(&self) -> &BTreeSet<ContributorId> {
        &self.expected
    }

    /// Everyone that responded, including unexpected contributors.
    pub fn responded(&self) -> &BTreeSet<ContributorId> {
        &self.responded
    }
}
