use std::time::{Instant, SystemTime};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A shell-command job submission, as handed to [`crate::Scheduler::submit`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JobSpec {
    /// Shell command line, passed to `/bin/sh -c`. Must be non-empty.
    pub cmd: String,
    /// CPU cores reserved against the quota while running.
    pub cpu_cores: u32,
    /// Memory in MiB reserved against the quota while running.
    pub memory_mb: u64,
    /// Seconds before SIGTERM is sent. 0 means no timeout.
    pub timeout_sec: u64,
    /// Larger runs first in priority mode; ignored in FIFO mode.
    pub priority: i32,
}

impl JobSpec {
    /// The token before the first literal space in `cmd`, or the whole
    /// string if there is none. Used by admission filtering. Splits on
    /// `' '` specifically, not general whitespace, matching the
    /// `cmd.find(' ')` the reference implementation uses.
    pub fn command_token(&self) -> &str {
        match self.cmd.find(' ') {
            Some(idx) => &self.cmd[..idx],
            None => &self.cmd,
        }
    }
}

/// In-memory lifecycle state of a [`Job`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Vocabulary understood by the durable store. Distinct from [`JobStatus`]
/// because the store additionally distinguishes `LaunchFailed`, a state a
/// `Job` never occupies in memory (a job that fails to launch is dropped
/// before being tracked — see the kernel's launch algorithm).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
    LaunchFailed,
}

impl PersistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistStatus::Queued => "queued",
            PersistStatus::Running => "running",
            PersistStatus::Succeeded => "succeeded",
            PersistStatus::Failed => "failed",
            PersistStatus::Timeout => "timeout",
            PersistStatus::LaunchFailed => "launch_failed",
        }
    }
}

/// Fixed CPU/memory ceiling the accountant reserves against.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResourceQuota {
    pub total_cpu: u32,
    pub total_mem_mb: u64,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        ResourceQuota {
            total_cpu: 4,
            total_mem_mb: 2048,
        }
    }
}

/// cgroup-v2 confinement settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CgroupConfig {
    pub enabled: bool,
    pub base_path: String,
    pub cpu_period_us: u64,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        CgroupConfig {
            enabled: false,
            base_path: "/sys/fs/cgroup/scheduler".to_string(),
            cpu_period_us: 100_000,
        }
    }
}

/// Full configuration surface, passed by value into [`crate::Scheduler::new`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SchedulerOptions {
    pub quota: ResourceQuota,
    pub cgroup: CgroupConfig,
    pub max_queue_size: usize,
    pub kill_grace_sec: u64,
    pub enable_priority: bool,
    pub enable_psi_monitor: bool,
    pub cmd_whitelist: Vec<String>,
    pub cmd_blacklist: Vec<String>,
    pub workdir: String,
    pub metrics_http_port: i32,
    pub rlimit_nofile: i64,
    pub disable_core_dump: bool,
    pub enable_persistence: bool,
    pub db_path: String,
    pub enable_cron: bool,
    pub cron_tick_ms: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            quota: ResourceQuota::default(),
            cgroup: CgroupConfig::default(),
            max_queue_size: 1000,
            kill_grace_sec: 2,
            enable_priority: false,
            enable_psi_monitor: false,
            cmd_whitelist: Vec::new(),
            cmd_blacklist: Vec::new(),
            workdir: String::new(),
            metrics_http_port: -1,
            rlimit_nofile: -1,
            disable_core_dump: true,
            enable_persistence: false,
            db_path: "state/tasks.db".to_string(),
            enable_cron: false,
            cron_tick_ms: 1000,
        }
    }
}

/// A parsed `@every <N>s` expression. No other grammar is supported; a
/// template whose expression fails to parse is dropped at configuration
/// time rather than carried around as an error state.
#[derive(Clone, Copy, Debug)]
pub struct CronExpression {
    pub interval: std::time::Duration,
}

impl CronExpression {
    pub fn parse(expr: &str) -> Option<Self> {
        let rest = expr.strip_prefix("@every ")?;
        let secs = rest.strip_suffix('s')?.parse::<u64>().ok()?;
        Some(CronExpression {
            interval: std::time::Duration::from_secs(secs),
        })
    }
}

/// A (interval, spec) pair the periodic trigger re-submits whenever its
/// `next_fire` has elapsed.
#[derive(Clone, Debug)]
pub struct CronTemplate {
    pub enabled: bool,
    pub interval: std::time::Duration,
    pub spec: JobSpec,
    pub next_fire: Instant,
}

/// A tracked job between submission and terminal classification.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u64,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub pid: i32,
    pub pgid: i32,
    pub sigterm_sent: bool,
    pub kill_deadline: Option<Instant>,
    pub enqueue_time: Instant,
    pub start_time: Instant,
    pub end_time: Instant,
    /// Wall-clock launch time in epoch milliseconds, captured once at
    /// launch so the reaper's terminal persistence update doesn't have to
    /// reconstruct it from a monotonic [`Instant`].
    pub start_ms: i64,
    pub exit_code: i32,
    pub cgroup_path: String,
}

impl Job {
    pub fn new(id: u64, spec: JobSpec, enqueue_time: Instant) -> Self {
        Job {
            id,
            spec,
            status: JobStatus::Pending,
            pid: -1,
            pgid: -1,
            sigterm_sent: false,
            kill_deadline: None,
            enqueue_time,
            start_time: enqueue_time,
            end_time: enqueue_time,
            start_ms: 0,
            exit_code: 0,
            cgroup_path: String::new(),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch, for values handed to the
/// durable store (which persists `system_clock` time, not `steady_clock`
/// instants — those are only meaningful within one process lifetime).
pub fn epoch_millis(now: SystemTime) -> i64 {
    now.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
