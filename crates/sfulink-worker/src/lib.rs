//! Media worker lifecycle and supervision.
//!
//! A [`Worker`] is one media worker, running either as a child process or as
//! a native entry point on a thread of this process, together with the
//! [`Channel`](sfulink_channel::Channel) used to talk to it. Both backends
//! produce the same channel; everything above this crate is backend-agnostic.
//! [`WorkerManager`] owns a set of workers and hands them out.

pub mod error;
pub mod manager;
pub mod native;
#[cfg(unix)]
mod process;
pub mod settings;
pub mod state;
pub mod worker;

pub use error::{Result, WorkerError};
pub use manager::WorkerManager;
pub use native::{ChannelReadFn, ChannelReadFreeFn, ChannelWriteFn, NativeWorkerRun};
pub use settings::{
    BackendKind, ChannelTimeouts, LogLevel, LogTag, ManagerConfig, WorkerSettings, WorkerStartup,
};
pub use state::{Failure, StateHandler, WorkerState};
pub use worker::{ExitReport, Worker, WorkerResourceUsage, INVALID_SETTINGS_EXIT_CODE};
