use std::sync::Mutex;
use std::time::Instant;

use crate::job::{CronTemplate, JobSpec};

type SubmitFn = Box<dyn Fn(JobSpec) -> i64 + Send + Sync>;

/// Holds a set of templates and re-submits those whose `next_fire` has
/// elapsed on each [`PeriodicTrigger::tick`].
///
/// The submit callback is captured once via [`PeriodicTrigger::set_submit_fn`]
/// rather than threaded through every `tick()` call — a single-producer
/// function reference, not a channel.
#[derive(Default)]
pub struct PeriodicTrigger {
    templates: Mutex<Vec<CronTemplate>>,
    submit_fn: Mutex<Option<SubmitFn>>,
}

impl PeriodicTrigger {
    pub fn new() -> Self {
        PeriodicTrigger {
            templates: Mutex::new(Vec::new()),
            submit_fn: Mutex::new(None),
        }
    }

    pub fn add_template(&self, template: CronTemplate) {
        self.templates.lock().unwrap().push(template);
    }

    pub fn set_submit_fn(&self, f: SubmitFn) {
        *self.submit_fn.lock().unwrap() = Some(f);
    }

    /// Re-submits every enabled template whose `next_fire` has elapsed,
    /// then advances that template's `next_fire`. A template that misses
    /// its submission (e.g. the queue was full) still advances — the tick
    /// is consumed either way.
    pub fn tick(&self) {
        let now = Instant::now();
        let submit_fn = self.submit_fn.lock().unwrap();
        let mut templates = self.templates.lock().unwrap();
        for tpl in templates.iter_mut() {
            if !tpl.enabled {
                continue;
            }
            if now >= tpl.next_fire {
                if let Some(f) = submit_fn.as_ref() {
                    f(tpl.spec.clone());
                }
                tpl.next_fire = now + tpl.interval;
            }
        }
    }
}
