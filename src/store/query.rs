//! Filters over job records.

use crate::core::state::JobState;
use crate::core::types::JobId;
use crate::storage::JobRecord;

/// Selects records by id, tag, state and unique name.
///
/// A record matches when it satisfies every non-empty list, and within a list
/// any one entry is enough. An empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkQuery {
    pub ids: Vec<JobId>,
    pub tags: Vec<String>,
    pub states: Vec<JobState>,
    pub unique_names: Vec<String>,
}

impl WorkQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.ids.extend(ids);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states.extend(states);
        self
    }

    pub fn with_unique_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        (self.ids.is_empty() || self.ids.contains(&record.id))
            && (self.tags.is_empty() || self.tags.iter().any(|t| record.has_tag(t)))
            && (self.states.is_empty() || self.states.contains(&record.state))
            && (self.unique_names.is_empty()
                || record
                    .unique_name
                    .as_ref()
                    .is_some_and(|name| self.unique_names.contains(name)))
    }
}
