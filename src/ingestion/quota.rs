use std::collections::HashMap;

/// Fairness stage of a run. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuotaStage {
    /// Every category capped at the base cap.
    A,
    /// Caps relaxed to `ceil(base * factor)`.
    B,
    /// No caps; the run only has to reach its target.
    C,
}

/// Per-run fairness parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPolicy {
    pub target: usize,
    pub base_cap: usize,
    pub relax_start: f64,
    pub relax_factor: f64,
    pub relax_final: f64,
}

impl QuotaPolicy {
    /// Without an explicit cap each category gets 5% of the target, at least 5.
    pub fn new(target: usize, base_cap: Option<usize>, relax_start: f64, relax_factor: f64, relax_final: f64) -> Self {
        let base_cap = base_cap.unwrap_or_else(|| (target / 20).max(5)).max(1);
        Self { target, base_cap, relax_start, relax_factor, relax_final }
    }

    pub fn relax_start_count(&self) -> usize {
        (self.target as f64 * self.relax_start).floor() as usize
    }

    pub fn relax_final_count(&self) -> usize {
        (self.target as f64 * self.relax_final).floor() as usize
    }

    pub fn relaxed_cap(&self) -> usize {
        (self.base_cap as f64 * self.relax_factor.max(1.0)).ceil() as usize
    }

    pub fn stage_for(&self, accepted: usize) -> QuotaStage {
        if accepted >= self.relax_final_count() {
            QuotaStage::C
        } else if accepted >= self.relax_start_count() {
            QuotaStage::B
        } else {
            QuotaStage::A
        }
    }

    pub fn cap_for(&self, stage: QuotaStage) -> Option<usize> {
        match stage {
            QuotaStage::A => Some(self.base_cap),
            QuotaStage::B => Some(self.relaxed_cap()),
            QuotaStage::C => None,
        }
    }
}

/// Counters for one category. `reserved` are candidates whose media and
/// embedding work is still in flight; they count against the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryQuota {
    pub accepted: usize,
    pub reserved: usize,
    pub cap: Option<usize>,
    pub stage: QuotaStage,
}

/// Owns every category counter of a run. Lives on the run's coordinator
/// task only, so reserve-then-commit needs no locking.
///
/// Progress is measured on committed acceptances; a reservation never moves
/// the stage forward.
#[derive(Debug)]
pub struct QuotaBook {
    policy: QuotaPolicy,
    categories: HashMap<String, CategoryQuota>,
    stage: QuotaStage,
    accepted: usize,
    reserved: usize,
}

impl QuotaBook {
    pub fn new(policy: QuotaPolicy) -> Self {
        let stage = policy.stage_for(0);
        Self { policy, categories: HashMap::new(), stage, accepted: 0, reserved: 0 }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn stage(&self) -> QuotaStage {
        self.stage
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// True while another candidate could still be reserved without overshooting.
    pub fn has_room(&self) -> bool {
        self.accepted + self.reserved < self.policy.target
    }

    pub fn is_complete(&self) -> bool {
        self.accepted >= self.policy.target
    }

    pub fn category(&self, key: &str) -> Option<&CategoryQuota> {
        self.categories.get(key)
    }

    pub fn accepted_per_category(&self) -> impl Iterator<Item = (&str, usize)> {
        self.categories.iter().map(|(k, q)| (k.as_str(), q.accepted))
    }

    /// Claims a slot for `key` if the target and the category's current cap allow it.
    pub fn try_reserve(&mut self, key: &str) -> bool {
        if !self.has_room() {
            return false;
        }
        let stage = self.stage;
        let cap = self.policy.cap_for(stage);
        let quota = self.categories.entry(key.to_string()).or_insert(CategoryQuota {
            accepted: 0,
            reserved: 0,
            cap,
            stage,
        });
        quota.cap = cap;
        quota.stage = stage;
        if let Some(cap) = cap {
            if quota.accepted + quota.reserved >= cap {
                return false;
            }
        }
        quota.reserved += 1;
        self.reserved += 1;
        true
    }

    /// Turns a reservation into an acceptance. Returns the new stage when this
    /// acceptance moved the run into a later one.
    pub fn commit(&mut self, key: &str) -> Option<QuotaStage> {
        let quota = self.categories.get_mut(key)?;
        if quota.reserved == 0 {
            return None;
        }
        quota.reserved -= 1;
        quota.accepted += 1;
        self.reserved -= 1;
        self.accepted += 1;

        let next = self.policy.stage_for(self.accepted).max(self.stage);
        if next > self.stage {
            self.stage = next;
            Some(next)
        } else {
            None
        }
    }

    /// Gives a reservation back after the candidate failed downstream.
    pub fn release(&mut self, key: &str) {
        if let Some(quota) = self.categories.get_mut(key) {
            if quota.reserved > 0 {
                quota.reserved -= 1;
                self.reserved -= 1;
            }
        }
    }
}
