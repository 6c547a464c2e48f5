//! Staged chains of job requests.
//!
//! Every request of a stage depends on all requests of the previous stage:
//!
//! ```
//! use deferq::{Chain, JobRequest};
//!
//! let a = JobRequest::builder("download").build().unwrap();
//! let b = JobRequest::builder("download").build().unwrap();
//! let c = JobRequest::builder("combine").build().unwrap();
//!
//! let chain = Chain::begin_with([a, b]).then([c]);
//! assert_eq!(chain.stages().len(), 2);
//! ```

use thiserror::Error;

use super::request::{ExistingWorkPolicy, JobRequest};

/// Errors produced when validating a chain.
#[derive(Debug, Error, PartialEq)]
pub enum ChainError {
    /// A stage has no requests.
    #[error("stage {0} is empty")]
    EmptyStage(usize),

    /// Periodic requests cannot take part in a chain.
    #[error("periodic request {0} cannot be chained")]
    PeriodicRequest(String),

    /// The same request appears twice.
    #[error("request {0} appears more than once")]
    DuplicateRequest(String),
}

/// An ordered sequence of stages.
#[derive(Debug, Clone)]
pub struct Chain {
    stages: Vec<Vec<JobRequest>>,
    unique: Option<(String, ExistingWorkPolicy)>,
}

impl Chain {
    /// Start a chain with a first stage of parallel requests.
    pub fn begin_with(requests: impl IntoIterator<Item = JobRequest>) -> Self {
        Self {
            stages: vec![requests.into_iter().collect()],
            unique: None,
        }
    }

    /// Append a stage that runs after every request of the previous one succeeds.
    pub fn then(mut self, requests: impl IntoIterator<Item = JobRequest>) -> Self {
        self.stages.push(requests.into_iter().collect());
        self
    }

    /// Bind the chain to a unique name.
    pub fn unique(mut self, name: impl Into<String>, policy: ExistingWorkPolicy) -> Self {
        self.unique = Some((name.into(), policy));
        self
    }

    pub fn stages(&self) -> &[Vec<JobRequest>] {
        &self.stages
    }

    pub fn unique_name(&self) -> Option<(&str, ExistingWorkPolicy)> {
        self.unique.as_ref().map(|(name, policy)| (name.as_str(), *policy))
    }

    /// Number of requests across all stages.
    pub fn len(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the chain is well-formed.
    pub fn validate(&self) -> Result<(), ChainError> {
        let mut seen = std::collections::HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.is_empty() {
                return Err(ChainError::EmptyStage(index));
            }
            for request in stage {
                if request.is_periodic() {
                    return Err(ChainError::PeriodicRequest(request.id().to_string()));
                }
                if !seen.insert(*request.id()) {
                    return Err(ChainError::DuplicateRequest(request.id().to_string()));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Vec<Vec<JobRequest>>, Option<(String, ExistingWorkPolicy)>) {
        (self.stages, self.unique)
    }
}
