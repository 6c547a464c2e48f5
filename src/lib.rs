//! deferq - a persistent, constraint-aware background job scheduler.
//!
//! Jobs are described by an immutable [`JobRequest`] and tracked by a
//! [`JobRecord`] in a [`JobStore`]. A [`Scheduler`] dispatches records whose
//! delay has elapsed, whose constraints hold and whose prerequisites
//! succeeded onto registered workers, retrying with backoff and repeating
//! periodic work.

pub mod config;
pub mod core;
pub mod events;
pub mod observe;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod testing;
pub mod worker;

pub use config::{
    ConfigError, LoadedRequest, RequestConfig, RequestConfigBuilder, SchedulerConfig,
    StorageConfig, YamlLoader, load_requests_from_directory,
};
pub use core::backoff::{BackoffKind, BackoffPolicy};
pub use core::chain::{Chain, ChainError};
pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::constraints::{ConstraintSet, DeviceSignals, NetworkStatus, NetworkType, SignalFeed};
pub use core::data::{Data, DataError, MAX_DATA_BYTES, Value};
pub use core::merger::{InputMerger, MergeError};
pub use core::request::{
    ExistingWorkPolicy, JobRequest, JobRequestBuilder, OutOfQuotaPolicy, Periodicity, RequestError,
};
pub use core::state::{FailureCause, JobState, StopReason};
pub use core::types::{ExecutionId, JobId};
pub use events::{Event, EventBus, EventHandler, ForegroundNotifier};
pub use observe::{JobObserver, QueryObserver};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, JobRecord, Storage, StorageError};
pub use store::{JobStore, StoreError, SubmitKind, SubmitOutcome, UpdateResult, WorkQuery};
pub use worker::{
    BlockingWorker, ProgressSink, RemoteError, RemoteWorker, StopSignal, WorkContext, WorkResult,
    Worker, WorkerKind, WorkerRegistry,
};
