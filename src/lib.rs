//! A single-host task scheduler: shell-command jobs run as supervised
//! child processes under CPU/memory quota accounting, with optional
//! cgroup-v2 confinement, graceful-then-forceful timeout termination, and
//! a plain-text metrics endpoint.
//!
//! ## Example
//!
//! ```rust,no_run
//! use taskscheduler::{JobSpec, Scheduler, SchedulerOptions};
//!
//! let scheduler = Scheduler::new(SchedulerOptions::default());
//! scheduler.start();
//!
//! let id = scheduler.submit(JobSpec {
//!     cmd: "echo hello".to_string(),
//!     cpu_cores: 1,
//!     memory_mb: 64,
//!     timeout_sec: 30,
//!     priority: 0,
//! });
//! assert!(id > 0);
//!
//! scheduler.stop();
//! ```

mod accountant;
mod cgroup;
mod cron;
mod error;
mod http;
mod job;
mod kernel;
mod metrics;
mod process;
mod store;

pub use error::SchedulerError;
pub use job::{
    CgroupConfig, CronExpression, CronTemplate, JobSpec, JobStatus, PersistStatus, ResourceQuota,
    SchedulerOptions,
};
pub use kernel::Scheduler;
pub use metrics::Snapshot;
