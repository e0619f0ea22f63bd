//! The scheduler kernel: intake queue, dispatcher, reaper, pressure
//! monitor, and periodic trigger, wired together behind one coarse mutex
//! plus lock-free metrics, per the concurrency model this crate targets.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::accountant::ResourceAccountant;
use crate::cgroup;
use crate::cron::PeriodicTrigger;
use crate::error::SchedulerError;
use crate::http::HttpExposer;
use crate::job::{self, CronTemplate, Job, JobSpec, JobStatus, PersistStatus, SchedulerOptions};
use crate::metrics::{Metrics, Snapshot};
use crate::process::{self, ExitOutcome};
use crate::store::JobStore;

struct KernelState {
    pending: VecDeque<Job>,
    running: HashMap<u64, Job>,
    next_id: u64,
}

/// Single-host job scheduler: intake, dispatch, supervision, and reaping
/// for shell-command jobs. Always held behind an `Arc` since its
/// background loops need to outlive any one call into `start()`.
pub struct Scheduler {
    opts: SchedulerOptions,
    accountant: ResourceAccountant,
    state: Mutex<KernelState>,
    cv: Condvar,
    shutting_down: AtomicBool,
    psi_backpressure: AtomicBool,
    metrics: Arc<Metrics>,
    store: Option<JobStore>,
    trigger: Option<PeriodicTrigger>,
    http: Mutex<HttpExposer>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(opts: SchedulerOptions) -> Arc<Self> {
        let store = if opts.enable_persistence {
            match JobStore::init(&opts.db_path) {
                Ok(store) => Some(store),
                Err(e) => {
                    tracing::error!(error = %e, path = %opts.db_path, "failed to open durable store; persistence disabled");
                    None
                }
            }
        } else {
            None
        };

        let trigger = if opts.enable_cron {
            Some(PeriodicTrigger::new())
        } else {
            None
        };

        Arc::new(Scheduler {
            accountant: ResourceAccountant::new(opts.quota),
            state: Mutex::new(KernelState {
                pending: VecDeque::new(),
                running: HashMap::new(),
                next_id: 1,
            }),
            cv: Condvar::new(),
            shutting_down: AtomicBool::new(true),
            psi_backpressure: AtomicBool::new(false),
            metrics: Arc::new(Metrics::default()),
            store,
            trigger,
            http: Mutex::new(HttpExposer::new()),
            threads: Mutex::new(Vec::new()),
            opts,
        })
    }

    /// Registers a periodic template. A no-op (logged) if the periodic
    /// trigger was not enabled in `SchedulerOptions`.
    pub fn add_cron_template(&self, template: CronTemplate) {
        match &self.trigger {
            Some(trigger) => trigger.add_template(template),
            None => tracing::warn!("add_cron_template called but enable_cron is false"),
        }
    }

    /// Parses `expr` as an `@every <N>s` expression and registers it as an
    /// enabled periodic template for `spec`. Unlike a malformed cgroup
    /// write or an unreachable store, a cron expression that fails to
    /// parse has no sensible degraded mode, so this rejects it outright
    /// instead of silently dropping the template.
    pub fn add_cron_template_from_expr(
        &self,
        expr: &str,
        spec: JobSpec,
    ) -> Result<(), SchedulerError> {
        let parsed = job::CronExpression::parse(expr)
            .ok_or_else(|| SchedulerError::InvalidCron(expr.to_string()))?;
        self.add_cron_template(CronTemplate {
            enabled: true,
            interval: parsed.interval,
            spec,
            next_fire: Instant::now() + parsed.interval,
        });
        Ok(())
    }

    fn validate_cmd(&self, spec: &JobSpec) -> bool {
        let token = spec.command_token();
        if !self.opts.cmd_whitelist.is_empty()
            && !self.opts.cmd_whitelist.iter().any(|w| w == token)
        {
            return false;
        }
        !self.opts.cmd_blacklist.iter().any(|b| b == token)
    }

    /// Admits `spec`, returning its id (> 0) or `-1` on rejection.
    pub fn submit(&self, spec: JobSpec) -> i64 {
        if !self.validate_cmd(&spec) {
            self.metrics.inc_rejected();
            tracing::warn!(cmd = %spec.cmd, "command rejected by whitelist/blacklist");
            return -1;
        }

        let mut state = self.state.lock().unwrap();
        if state.pending.len() >= self.opts.max_queue_size {
            self.metrics.inc_rejected();
            return -1;
        }

        let id = state.next_id;
        state.next_id += 1;

        if let Some(store) = &self.store {
            let ms = job::epoch_millis(SystemTime::now());
            store.insert(&spec, PersistStatus::Queued, ms);
        }

        let job = Job::new(id, spec, Instant::now());
        state.pending.push_back(job);
        self.metrics.inc_submitted();
        self.metrics.set_pending(state.pending.len() as i64);

        drop(state);
        self.cv.notify_all();
        id as i64
    }

    /// Restores unfinished jobs from the durable store into the pending
    /// queue as fresh `Pending` entries, raising `next_id` above every
    /// restored id.
    fn restore_from_store(&self) {
        let Some(store) = &self.store else { return };
        let persisted = store.load_unfinished();
        if persisted.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for pj in persisted {
            state.next_id = state.next_id.max(pj.id + 1);
            state.pending.push_back(Job::new(pj.id, pj.spec, Instant::now()));
        }
        self.metrics.set_pending(state.pending.len() as i64);
        drop(state);
        self.cv.notify_all();
    }

    /// Restores unfinished jobs, starts the metrics HTTP exposer (if
    /// configured) and every background loop. Must be called exactly once
    /// before any job can run.
    pub fn start(self: &Arc<Self>) {
        self.shutting_down.store(false, Ordering::SeqCst);
        self.restore_from_store();

        if self.opts.metrics_http_port > 0 {
            let metrics = Arc::clone(&self.metrics);
            let mut http = self.http.lock().unwrap();
            if let Err(e) = http.start(self.opts.metrics_http_port as u16, move || metrics.to_text()) {
                tracing::error!(error = %e, port = self.opts.metrics_http_port, "failed to start metrics HTTP exposer");
            }
        }

        let mut threads = self.threads.lock().unwrap();

        {
            let sched = Arc::clone(self);
            threads.push(spawn_loop("dispatcher", move || sched.dispatcher_loop()));
        }
        {
            let sched = Arc::clone(self);
            threads.push(spawn_loop("reaper", move || sched.reaper_loop()));
        }
        if self.opts.enable_psi_monitor {
            let sched = Arc::clone(self);
            threads.push(spawn_loop("psi-monitor", move || sched.psi_loop()));
        }
        if self.opts.enable_cron {
            if let Some(trigger) = &self.trigger {
                // A weak handle breaks the ownership cycle: `self` owns
                // `trigger`, so a strong self-reference captured here would
                // keep the scheduler alive forever.
                let weak: Weak<Scheduler> = Arc::downgrade(self);
                trigger.set_submit_fn(Box::new(move |spec| {
                    weak.upgrade().map(|s| s.submit(spec)).unwrap_or(-1)
                }));
                let sched = Arc::clone(self);
                threads.push(spawn_loop("cron", move || sched.cron_loop()));
            }
        }
    }

    /// Idempotent. Stops background loops and the HTTP exposer but does not
    /// terminate in-flight children — they are orphaned if still running
    /// when their reaper iteration never comes.
    pub fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cv.notify_all();
        self.http.lock().unwrap().stop();
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }

    pub fn idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.is_empty() && state.running.is_empty()
    }

    pub fn metrics_snapshot(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Selects and removes the next job to dispatch: FIFO by default, or
    /// highest-priority-first with ties broken by smallest id when
    /// `enable_priority` is set. Updates the pending gauge unconditionally
    /// — the canonical rule is that *every* mutation of pending updates it.
    fn pick_next_job(&self, state: &mut KernelState) -> Option<Job> {
        if state.pending.is_empty() {
            return None;
        }
        let job = if self.opts.enable_priority {
            let mut best = 0;
            for i in 1..state.pending.len() {
                let better = {
                    let cand = &state.pending[i];
                    let cur = &state.pending[best];
                    cand.spec.priority > cur.spec.priority
                        || (cand.spec.priority == cur.spec.priority && cand.id < cur.id)
                };
                if better {
                    best = i;
                }
            }
            state.pending.remove(best)
        } else {
            state.pending.pop_front()
        };
        self.metrics.set_pending(state.pending.len() as i64);
        job
    }

    fn dispatcher_loop(&self) {
        loop {
            let mut state = self
                .cv
                .wait_while(self.state.lock().unwrap(), |s| {
                    !self.shutting_down.load(Ordering::SeqCst) && s.pending.is_empty()
                })
                .unwrap();
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            if self.opts.enable_psi_monitor && self.psi_backpressure.load(Ordering::SeqCst) {
                self.metrics.inc_pressure_blocked();
                drop(state);
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            let mut job = match self.pick_next_job(&mut state) {
                Some(job) => job,
                None => continue,
            };

            let wait_ms = Instant::now().duration_since(job.enqueue_time).as_millis() as i64;
            self.metrics.record_queue_wait(wait_ms);

            if !self.accountant.reserve(job.spec.cpu_cores, job.spec.memory_mb) {
                // Requeue to the tail (even in priority mode) so a
                // too-large head-of-line job cannot live-lock the queue.
                state.pending.push_back(job);
                self.metrics.set_pending(state.pending.len() as i64);
                drop(state);
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }

            let launched = self.launch_job(&mut job);
            if launched {
                state.running.insert(job.id, job);
            }
            drop(state);

            if !launched {
                self.accountant.release(job.spec.cpu_cores, job.spec.memory_mb);
            }
        }
    }

    /// Forks, confines, and execs `job`. Called with the kernel mutex still
    /// held, so a slow child setup briefly blocks new submissions — this
    /// keeps launch order consistent with dispatch order. Returns `false`
    /// (the job is dropped, not requeued) only on fork failure.
    fn launch_job(&self, job: &mut Job) -> bool {
        let cg_path = if self.opts.cgroup.enabled {
            cgroup::create(job.id, job.spec.cpu_cores, job.spec.memory_mb, &self.opts.cgroup)
        } else {
            String::new()
        };

        match unsafe { process::fork() } {
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "fork failed");
                self.metrics.inc_launch_failed();
                false
            }
            Ok(process::ForkResult::Child) => {
                let _ = process::setpgid_self();
                if !cg_path.is_empty() {
                    cgroup::attach(std::process::id() as i32, &cg_path);
                }
                if self.opts.rlimit_nofile >= 0 {
                    let _ = process::set_rlimit_nofile(self.opts.rlimit_nofile as u64);
                }
                if self.opts.disable_core_dump {
                    let _ = process::disable_core_dump();
                }
                if !self.opts.workdir.is_empty() {
                    let _ = process::chdir(&self.opts.workdir);
                }
                let _ = process::exec_shell(&job.spec.cmd);
                // `exec_shell` only returns on failure. Between here and
                // process death only async-signal-safe calls are safe: no
                // `eprintln!` (stdio lock), no `std::process::exit` (runs
                // atexit handlers and flushes C stdio, either of which can
                // deadlock on a lock held by another thread in the parent
                // at the instant of fork). `libc::_exit` skips all of that.
                unsafe { libc::_exit(127) };
            }
            Ok(process::ForkResult::Parent { child_pid }) => {
                job.pid = child_pid;
                job.pgid = child_pid;
                job.start_time = Instant::now();
                job.status = JobStatus::Running;
                job.cgroup_path = cg_path;

                if let Some(store) = &self.store {
                    let ms = job::epoch_millis(SystemTime::now());
                    job.start_ms = ms;
                    store.update(job.id, PersistStatus::Running, 0, ms, 0);
                }
                self.metrics.inc_running();
                true
            }
        }
    }

    fn reaper_loop(&self) {
        while !self.shutting_down.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let mut finished = Vec::new();

            for (&id, job) in state.running.iter_mut() {
                if job.spec.timeout_sec > 0 {
                    let elapsed = now.duration_since(job.start_time).as_secs();
                    if elapsed >= job.spec.timeout_sec {
                        if !job.sigterm_sent {
                            let _ = process::kill_process_group(job.pgid, libc::SIGTERM);
                            job.sigterm_sent = true;
                            job.kill_deadline =
                                Some(now + Duration::from_secs(self.opts.kill_grace_sec));
                        } else if job.kill_deadline.is_some_and(|deadline| now >= deadline) {
                            let _ = process::kill_process_group(job.pgid, libc::SIGKILL);
                        }
                    }
                }

                match process::waitpid_nonblocking(job.pid) {
                    Ok(Some(outcome)) => {
                        job.end_time = now;
                        let (status, persist_status, exit_code) = classify(job, outcome);
                        job.status = status;
                        job.exit_code = exit_code;

                        match status {
                            JobStatus::Timeout => self.metrics.inc_timeout(),
                            JobStatus::Succeeded => self.metrics.inc_succeeded(),
                            JobStatus::Failed => self.metrics.inc_failed(),
                            _ => {}
                        }
                        self.accountant.release(job.spec.cpu_cores, job.spec.memory_mb);
                        self.metrics.dec_running();
                        if self.opts.cgroup.enabled {
                            cgroup::cleanup(&job.cgroup_path);
                        }
                        if let Some(store) = &self.store {
                            let end_ms = job::epoch_millis(SystemTime::now());
                            store.update(job.id, persist_status, exit_code, job.start_ms, end_ms);
                        }
                        finished.push(id);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(job_id = job.id, error = %e, "waitpid failed");
                    }
                }
            }

            for id in finished {
                state.running.remove(&id);
            }
        }
    }

    fn psi_loop(&self) {
        while !self.shutting_down.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
            let path = format!("{}/memory.pressure", self.opts.cgroup.base_path);
            let avg10 = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| parse_psi_avg10(&s))
                .unwrap_or(0.0);
            let pressure = avg10 > 50.0;
            let previous = self.psi_backpressure.swap(pressure, Ordering::SeqCst);
            if previous != pressure {
                self.metrics.set_pressure_active(pressure);
                if pressure {
                    tracing::warn!("PSI backpressure activated");
                } else {
                    tracing::info!("PSI backpressure cleared");
                }
            }
        }
    }

    fn cron_loop(&self) {
        while !self.shutting_down.load(Ordering::SeqCst) {
            if let Some(trigger) = &self.trigger {
                trigger.tick();
            }
            std::thread::sleep(Duration::from_millis(self.opts.cron_tick_ms));
        }
    }
}

fn classify(job: &Job, outcome: ExitOutcome) -> (JobStatus, PersistStatus, i32) {
    if job.sigterm_sent {
        let code = match outcome {
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(sig) => 128 + sig,
        };
        return (JobStatus::Timeout, PersistStatus::Timeout, code);
    }
    match outcome {
        ExitOutcome::Exited(0) => (JobStatus::Succeeded, PersistStatus::Succeeded, 0),
        ExitOutcome::Exited(code) => (JobStatus::Failed, PersistStatus::Failed, code),
        ExitOutcome::Signaled(sig) => (JobStatus::Failed, PersistStatus::Failed, 128 + sig),
    }
}

fn parse_psi_avg10(content: &str) -> Option<f64> {
    content
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("avg10="))
        .and_then(|v| v.parse().ok())
}

fn spawn_loop(name: &'static str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run_guarded(name, f))
        .expect("spawn background thread")
}

/// Runs `f`, catching any panic so that one misbehaving background loop
/// degrades the kernel instead of taking the whole process down. The
/// thread simply exits afterward — crashed loops are never restarted.
fn run_guarded(name: &str, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        tracing::error!(loop_name = name, panic = %panic_message(&payload), "background loop panicked; thread exiting");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::Scheduler;
    use crate::job::{CronTemplate, JobSpec, SchedulerOptions};

    fn spec(cmd: &str, priority: i32) -> JobSpec {
        JobSpec {
            cmd: cmd.to_string(),
            cpu_cores: 1,
            memory_mb: 16,
            timeout_sec: 5,
            priority,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if cond() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn idle_reflects_pending_and_running_state() {
        let sched = Scheduler::new(SchedulerOptions::default());
        assert!(sched.idle());
        assert!(sched.submit(spec("exit 0", 0)) > 0);
        assert!(!sched.idle());
    }

    #[test]
    fn blacklisted_command_is_rejected_without_touching_the_queue() {
        let mut opts = SchedulerOptions::default();
        opts.cmd_blacklist = vec!["rm".to_string()];
        let sched = Scheduler::new(opts);

        assert_eq!(sched.submit(spec("rm -rf /tmp/x", 0)), -1);
        assert_eq!(sched.metrics_snapshot().rejected, 1);
        assert_eq!(sched.metrics_snapshot().submitted, 0);
        assert!(sched.idle());
    }

    #[test]
    fn whitelist_admits_only_listed_commands() {
        let mut opts = SchedulerOptions::default();
        opts.cmd_whitelist = vec!["echo".to_string()];
        let sched = Scheduler::new(opts);

        assert!(sched.submit(spec("echo hi", 0)) > 0);
        assert_eq!(sched.submit(spec("ls -la", 0)), -1);
    }

    #[test]
    fn full_queue_rejects_further_submissions() {
        let mut opts = SchedulerOptions::default();
        opts.max_queue_size = 1;
        let sched = Scheduler::new(opts);

        assert!(sched.submit(spec("exit 0", 0)) > 0);
        assert_eq!(sched.submit(spec("exit 0", 0)), -1);
        assert_eq!(sched.metrics_snapshot().rejected, 1);
    }

    #[test]
    fn submitted_job_runs_to_completion_and_is_reaped() {
        let sched = Scheduler::new(SchedulerOptions::default());
        assert!(sched.submit(spec("exit 0", 0)) > 0);
        sched.start();

        assert!(wait_until(|| sched.idle(), Duration::from_secs(5)));
        sched.stop();

        let snap = sched.metrics_snapshot();
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.running, 0);
    }

    #[test]
    fn failing_command_is_classified_as_failed() {
        let sched = Scheduler::new(SchedulerOptions::default());
        assert!(sched.submit(spec("exit 7", 0)) > 0);
        sched.start();

        assert!(wait_until(|| sched.idle(), Duration::from_secs(5)));
        sched.stop();

        assert_eq!(sched.metrics_snapshot().failed, 1);
    }

    #[test]
    fn timed_out_job_is_terminated_and_classified_as_timeout() {
        let mut opts = SchedulerOptions::default();
        opts.kill_grace_sec = 1;
        let sched = Scheduler::new(opts);

        let mut job_spec = spec("sleep 30", 0);
        job_spec.timeout_sec = 1;
        assert!(sched.submit(job_spec) > 0);
        sched.start();

        assert!(wait_until(|| sched.idle(), Duration::from_secs(10)));
        sched.stop();

        assert_eq!(sched.metrics_snapshot().timeout, 1);
    }

    #[test]
    fn higher_priority_job_runs_before_lower_priority_job_submitted_earlier() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.txt");

        let mut opts = SchedulerOptions::default();
        opts.enable_priority = true;
        opts.quota.total_cpu = 1;
        opts.quota.total_mem_mb = 512;
        let sched = Scheduler::new(opts);

        let write = |label: &str, prio: i32| spec(&format!("echo {label} >> {}", out.display()), prio);

        assert!(sched.submit(write("low", 1)) > 0);
        assert!(sched.submit(write("high", 10)) > 0);
        assert!(sched.submit(write("mid", 5)) > 0);

        sched.start();
        assert!(wait_until(|| sched.idle(), Duration::from_secs(10)));
        sched.stop();

        let contents = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["high", "mid", "low"]);
    }

    #[test]
    fn restore_from_store_reschedules_unfinished_jobs_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("tasks.db");

        let mut opts = SchedulerOptions::default();
        opts.enable_persistence = true;
        opts.db_path = db_path.to_str().unwrap().to_string();

        {
            // Submits a job and is dropped before ever starting, simulating
            // a crash before the job was dispatched.
            let sched = Scheduler::new(opts.clone());
            assert!(sched.submit(spec("exit 0", 0)) > 0);
        }

        let sched = Scheduler::new(opts);
        assert!(sched.idle());
        sched.start();

        assert!(wait_until(|| sched.idle(), Duration::from_secs(5)));
        sched.stop();

        assert_eq!(sched.metrics_snapshot().succeeded, 1);
    }

    #[test]
    fn cron_template_resubmits_on_its_own_schedule() {
        let mut opts = SchedulerOptions::default();
        opts.enable_cron = true;
        opts.cron_tick_ms = 20;
        let sched = Scheduler::new(opts);

        sched.add_cron_template(CronTemplate {
            enabled: true,
            interval: Duration::from_millis(50),
            spec: spec("exit 0", 0),
            next_fire: Instant::now(),
        });

        sched.start();
        assert!(wait_until(
            || sched.metrics_snapshot().submitted >= 2,
            Duration::from_secs(5)
        ));
        sched.stop();
    }

    #[test]
    fn add_cron_template_from_expr_rejects_unparsable_grammar() {
        let mut opts = SchedulerOptions::default();
        opts.enable_cron = true;
        let sched = Scheduler::new(opts);

        assert!(sched
            .add_cron_template_from_expr("@every 5s", spec("exit 0", 0))
            .is_ok());
        assert!(matches!(
            sched.add_cron_template_from_expr("0 0 * * *", spec("exit 0", 0)),
            Err(SchedulerError::InvalidCron(_))
        ));
    }
}
