//! Creates, populates, and destroys per-job cgroup-v2 directories.
//!
//! Confinement is best-effort throughout: a failure at any step is logged
//! and the caller proceeds without full confinement rather than dropping
//! the job, per the confinement helper's contract.

use std::path::{Path, PathBuf};

use crate::job::CgroupConfig;

fn write_value(path: &Path, value: &str) -> std::io::Result<()> {
    std::fs::write(path, value)
}

/// Creates `<base_path>/job_<id>/` and writes `cpu.max`/`memory.max`.
/// Returns the directory path, or an empty string if the directory itself
/// could not be created (individual file-write failures are tolerated).
pub fn create(job_id: u64, cpu_cores: u32, mem_mb: u64, cfg: &CgroupConfig) -> String {
    let dir: PathBuf = Path::new(&cfg.base_path).join(format!("job_{job_id}"));
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(job_id, error = %e, "failed to create cgroup dir");
        return String::new();
    }

    let quota = u64::from(cpu_cores) * cfg.cpu_period_us;
    if let Err(e) = write_value(&dir.join("cpu.max"), &format!("{quota} {}", cfg.cpu_period_us)) {
        tracing::warn!(job_id, error = %e, "failed to write cpu.max");
    }

    let bytes = mem_mb * 1024 * 1024;
    if let Err(e) = write_value(&dir.join("memory.max"), &bytes.to_string()) {
        tracing::warn!(job_id, error = %e, "failed to write memory.max");
    }

    dir.to_string_lossy().into_owned()
}

/// Appends `pid` to `<path>/cgroup.procs`. A no-op returning `false` when
/// `path` is empty (confinement was not set up for this job).
///
/// Called on the forked-child side of `launch_job`, between `fork()` and
/// `exec`, where only async-signal-safe operations are safe to run — unlike
/// every other fallible step in this module, a failure here is not logged:
/// `tracing::warn!` can block on the subscriber's internal lock, which may
/// already be held by another thread in the parent at the instant of fork.
pub fn attach(pid: i32, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    write_value(&Path::new(path).join("cgroup.procs"), &pid.to_string()).is_ok()
}

/// Recursively removes `path`, logging but ignoring failure.
pub fn cleanup(path: &str) {
    if path.is_empty() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(path) {
        tracing::warn!(path, error = %e, "failed to cleanup cgroup");
    }
}
