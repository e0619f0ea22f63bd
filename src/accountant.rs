use std::sync::Mutex;

use crate::job::ResourceQuota;

/// Tracks reserved CPU cores and memory against a fixed quota.
///
/// `reserve` and `release` touch both counters under one lock so that a
/// snapshot from [`ResourceAccountant::used`] is never torn between the two.
pub struct ResourceAccountant {
    quota: ResourceQuota,
    used: Mutex<(u32, u64)>,
}

impl ResourceAccountant {
    pub fn new(quota: ResourceQuota) -> Self {
        ResourceAccountant {
            quota,
            used: Mutex::new((0, 0)),
        }
    }

    /// Reserves `cpu`/`mem_mb` if doing so would not exceed the quota.
    /// Returns `false` (making no change) if either counter would overflow.
    pub fn reserve(&self, cpu: u32, mem_mb: u64) -> bool {
        let mut used = self.used.lock().unwrap();
        if used.0 + cpu > self.quota.total_cpu || used.1 + mem_mb > self.quota.total_mem_mb {
            return false;
        }
        used.0 += cpu;
        used.1 += mem_mb;
        true
    }

    /// Releases a prior reservation. Saturates at zero to tolerate a buggy
    /// caller releasing more than it reserved.
    pub fn release(&self, cpu: u32, mem_mb: u64) {
        let mut used = self.used.lock().unwrap();
        used.0 = used.0.saturating_sub(cpu);
        used.1 = used.1.saturating_sub(mem_mb);
    }

    pub fn used(&self) -> (u32, u64) {
        *self.used.lock().unwrap()
    }
}
