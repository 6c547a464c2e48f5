//! Job type to worker lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::remote::RemoteWorker;
use super::{BlockingWorker, Worker};

/// A registered worker and how it is run.
#[derive(Clone)]
pub enum WorkerKind {
    Async(Arc<dyn Worker>),
    Blocking(Arc<dyn BlockingWorker>),
    Remote(Arc<RemoteWorker>),
}

impl WorkerKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::Async(_) => "async",
            WorkerKind::Blocking(_) => "blocking",
            WorkerKind::Remote(_) => "remote",
        }
    }
}

/// Maps job type names to workers.
///
/// Aliases let records submitted under a legacy type name run on the
/// worker registered for its replacement.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerKind>,
    aliases: HashMap<String, String>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_async(&mut self, job_type: impl Into<String>, worker: impl Worker + 'static) {
        self.register(job_type, WorkerKind::Async(Arc::new(worker)));
    }

    pub fn register_blocking(
        &mut self,
        job_type: impl Into<String>,
        worker: impl BlockingWorker + 'static,
    ) {
        self.register(job_type, WorkerKind::Blocking(Arc::new(worker)));
    }

    pub fn register_remote(&mut self, job_type: impl Into<String>, worker: RemoteWorker) {
        self.register(job_type, WorkerKind::Remote(Arc::new(worker)));
    }

    /// Register an already wrapped worker, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, kind: WorkerKind) {
        let job_type = job_type.into();
        tracing::debug!(job_type = %job_type, kind = kind.name(), "Registered worker");
        self.workers.insert(job_type, kind);
    }

    /// Run records of type `legacy` on the worker registered for `current`.
    pub fn alias(&mut self, legacy: impl Into<String>, current: impl Into<String>) {
        self.aliases.insert(legacy.into(), current.into());
    }

    /// Worker for a job type, following one level of aliasing.
    pub fn resolve(&self, job_type: &str) -> Option<WorkerKind> {
        self.workers
            .get(job_type)
            .or_else(|| {
                self.aliases
                    .get(job_type)
                    .and_then(|target| self.workers.get(target))
            })
            .cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.resolve(job_type).is_some()
    }

    /// Registered job type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
