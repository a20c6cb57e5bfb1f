//! Resource manager (component D): per-resource wait queues and active-use
//! maps, enforcing mutual exclusion, shared-mode compatibility, priority,
//! start-time reservations, and non-overlap guarantees.
//!
//! Ported from `tessia/server/scheduler/resources_manager.py`'s
//! `ResourcesManager`: the ordering predicate, the overlap check, and the
//! `can_enqueue`/`can_start` contracts are the same decisions, expressed over
//! `Job` values instead of ORM rows and over `Vec`/`HashMap` instead of
//! Python lists/dicts (queues are small — spec §9's "arena-free queues" note).

use std::collections::HashMap;

use crate::error::ResourceError;
use crate::model::{Job, JobState, Mode, TimeSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    job_id: i64,
    mode: Mode,
}

#[derive(Default)]
pub struct ResourceManager {
    wait_queues: HashMap<String, Vec<QueueEntry>>,
    active_exclusive: HashMap<String, i64>,
    active_shared: HashMap<String, HashMap<i64, ()>>,
    /// Snapshot of jobs the manager currently knows about, keyed by id.
    /// The scheduler loop is the source of truth for job state; this map
    /// exists only so the manager can answer queue/overlap questions about
    /// jobs it has been told about via `enqueue`/`set_active`.
    jobs: HashMap<i64, Job>,
    grace_seconds: i64,
}

impl ResourceManager {
    pub fn new(grace_seconds: i64) -> Self {
        ResourceManager {
            grace_seconds,
            ..Default::default()
        }
    }

    /// Insert `job` into every resource queue it touches, at the position
    /// given by the ordering predicate. Requires `job.state == Waiting`.
    pub fn enqueue(&mut self, job: Job) {
        debug_assert_eq!(job.state, JobState::Waiting);
        for (resource, mode) in job.resources.iter() {
            let queue = self.wait_queues.entry(resource.to_string()).or_default();
            let pos = queue
                .iter()
                .position(|existing| {
                    let existing_job = self.jobs.get(&existing.job_id);
                    match existing_job {
                        Some(q) => precedes(&job, q),
                        None => false,
                    }
                })
                .unwrap_or(queue.len());
            queue.insert(
                pos,
                QueueEntry {
                    job_id: job.id,
                    mode,
                },
            );
        }
        self.jobs.insert(job.id, job);
    }

    /// Remove `job` from every queue that references it, eliding now-empty queues.
    pub fn wait_pop(&mut self, job_id: i64) {
        let mut empty = Vec::new();
        for (resource, queue) in self.wait_queues.iter_mut() {
            queue.retain(|e| e.job_id != job_id);
            if queue.is_empty() {
                empty.push(resource.clone());
            }
        }
        for resource in empty {
            self.wait_queues.remove(&resource);
        }
    }

    /// Move `job` into the active maps (on WAITING → RUNNING/CLEANINGUP).
    pub fn set_active(&mut self, job: Job) {
        for (resource, mode) in job.resources.iter() {
            match mode {
                Mode::Exclusive => {
                    self.active_exclusive.insert(resource.to_string(), job.id);
                }
                Mode::Shared => {
                    self.active_shared
                        .entry(resource.to_string())
                        .or_default()
                        .insert(job.id, ());
                }
            }
        }
        self.jobs.insert(job.id, job);
    }

    /// Remove `job` from the active maps (on termination).
    pub fn active_pop(&mut self, job_id: i64) {
        self.active_exclusive.retain(|_, v| *v != job_id);
        for holders in self.active_shared.values_mut() {
            holders.remove(&job_id);
        }
        self.active_shared.retain(|_, holders| !holders.is_empty());
    }

    /// Record or refresh a job's full record without touching queue/active
    /// membership (used by startup recovery to prime the job cache before
    /// calling `enqueue`/`set_active`).
    pub fn remember(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    fn active_exclusive_holder(&self, resource: &str) -> Option<&Job> {
        self.active_exclusive
            .get(resource)
            .and_then(|id| self.jobs.get(id))
    }

    fn active_shared_holders(&self, resource: &str) -> Vec<&Job> {
        self.active_shared
            .get(resource)
            .map(|holders| holders.keys().filter_map(|id| self.jobs.get(id)).collect())
            .unwrap_or_default()
    }

    /// Can `job` be enqueued without creating a guaranteed overlap with
    /// other start-dated commitments?
    pub fn can_enqueue(&self, job: &Job, now: i64) -> bool {
        let Some(_start_date) = job.start_date else {
            return true;
        };
        if job.timeout == 0 {
            return false;
        }
        let (c_start, c_end) = job.reservation_window(now, self.grace_seconds);

        for (resource, mode) in job.resources.iter() {
            // Active holders.
            if mode == Mode::Exclusive {
                if let Some(holder) = self.active_exclusive_holder(resource) {
                    if overlaps((c_start, c_end), holder.active_window(self.grace_seconds)) {
                        return false;
                    }
                }
                for holder in self.active_shared_holders(resource) {
                    if overlaps((c_start, c_end), holder.active_window(self.grace_seconds)) {
                        return false;
                    }
                }
            } else if let Some(holder) = self.active_exclusive_holder(resource) {
                if overlaps((c_start, c_end), holder.active_window(self.grace_seconds)) {
                    return false;
                }
            }

            // Queued, start-dated jobs (the queue is sorted start-dated-first).
            if let Some(queue) = self.wait_queues.get(resource) {
                for entry in queue {
                    let Some(queued) = self.jobs.get(&entry.job_id) else {
                        continue;
                    };
                    if queued.start_date.is_none() {
                        break;
                    }
                    if entry.mode == Mode::Shared && mode == Mode::Shared {
                        continue;
                    }
                    let queued_window = queued.reservation_window(now, self.grace_seconds);
                    if overlaps((c_start, c_end), queued_window) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Is `job` eligible to be dispatched right now?
    pub fn can_start(&self, job: &Job, now: i64, slot: TimeSlot) -> Result<bool, ResourceError> {
        if job.state != JobState::Waiting {
            return Ok(false);
        }
        if let Some(start_date) = job.start_date {
            if start_date > now {
                return Ok(false);
            }
        }
        if job.time_slot != slot {
            return Ok(false);
        }

        for (resource, mode) in job.resources.iter() {
            if self.active_exclusive_holder(resource).is_some() {
                return Ok(false);
            }
            if mode == Mode::Exclusive && !self.active_shared_holders(resource).is_empty() {
                return Ok(false);
            }
        }

        for (resource, mode) in job.resources.iter() {
            if !self.has_valid_head_position(job, resource, mode, now)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn has_valid_head_position(
        &self,
        job: &Job,
        resource: &str,
        mode: Mode,
        now: i64,
    ) -> Result<bool, ResourceError> {
        let queue = self
            .wait_queues
            .get(resource)
            .ok_or_else(|| ResourceError::MissingFromQueue(job.id.to_string(), resource.to_string()))?;
        let pos = queue
            .iter()
            .position(|e| e.job_id == job.id)
            .ok_or_else(|| ResourceError::MissingFromQueue(job.id.to_string(), resource.to_string()))?;

        for entry in &queue[..pos] {
            if entry.mode == Mode::Shared && mode == Mode::Shared {
                continue;
            }
            let Some(ahead) = self.jobs.get(&entry.job_id) else {
                continue;
            };
            // The only overtake allowed: a future start-dated job ahead of
            // us, where our own (start_date-less, finite-timeout) window
            // fits entirely before its window begins.
            let Some(ahead_start) = ahead.start_date else {
                return Ok(false);
            };
            if ahead_start <= now {
                return Ok(false);
            }
            if job.start_date.is_some() || job.timeout == 0 {
                return Ok(false);
            }
            let (_, Some(c_end)) = job.reservation_window(now, self.grace_seconds) else {
                return Ok(false);
            };
            if c_end > ahead_start {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Ordering predicate: does candidate `c` precede queued entry `q`?
fn precedes(c: &Job, q: &Job) -> bool {
    match (c.start_date, q.start_date) {
        (Some(_), None) => return true,
        (None, Some(_)) => return false,
        (Some(cs), Some(qs)) if cs != qs => return cs < qs,
        _ => {}
    }
    if c.priority != q.priority {
        return c.priority < q.priority;
    }
    c.submit_date < q.submit_date
}

/// `true` if `[a_start, a_end)` overlaps `[b_start, b_end)`. `None` end means
/// open-ended (unbounded timeout).
fn overlaps(a: (i64, Option<i64>), b: (i64, Option<i64>)) -> bool {
    let (a_start, a_end) = a;
    let (b_start, b_end) = b;
    let a_before_b_ends = b_end.map(|e| a_start < e).unwrap_or(true);
    let b_before_a_ends = a_end.map(|e| b_start < e).unwrap_or(true);
    a_before_b_ends && b_before_a_ends
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resources;

    fn job(id: i64, priority: i32, submit_date: i64, start_date: Option<i64>, timeout: u64, resources: Resources) -> Job {
        Job {
            id,
            job_type: "echo".into(),
            parameters: "{}".into(),
            resources,
            description: "t".into(),
            priority,
            submit_date,
            start_date,
            time_slot: TimeSlot::DEFAULT,
            timeout,
            state: JobState::Waiting,
            pid: None,
            start_date_actual: None,
            end_date: None,
            result: String::new(),
        }
    }

    fn shared(res: &str) -> Resources {
        Resources {
            exclusive: vec![],
            shared: vec![res.to_string()],
        }
    }
    fn exclusive(res: &str) -> Resources {
        Resources {
            exclusive: vec![res.to_string()],
            shared: vec![],
        }
    }

    #[test]
    fn scenario_1_two_compatible_shared_readers_both_head() {
        let mut rm = ResourceManager::new(300);
        let a = job(1, 0, 0, None, 0, shared("sys1"));
        let b = job(2, 0, 1, None, 0, shared("sys1"));
        rm.enqueue(a.clone());
        rm.enqueue(b.clone());
        assert!(rm.can_start(&a, 100, TimeSlot::DEFAULT).unwrap());
        assert!(rm.can_start(&b, 100, TimeSlot::DEFAULT).unwrap());
    }

    #[test]
    fn scenario_2_exclusive_blocks_shared() {
        let mut rm = ResourceManager::new(300);
        let mut a = job(1, 0, 0, None, 0, exclusive("sys1"));
        a.state = JobState::Running;
        a.start_date_actual = Some(0);
        rm.set_active(a);

        let b = job(2, 0, 1, None, 0, shared("sys1"));
        rm.enqueue(b.clone());
        assert!(!rm.can_start(&b, 100, TimeSlot::DEFAULT).unwrap());
    }

    #[test]
    fn scenario_3_start_dated_reservation_survives_overtake() {
        let mut rm = ResourceManager::new(300);
        let t0 = 0i64;
        let a = job(1, 5, t0, Some(t0 + 3600), 1800, exclusive("sys1"));
        assert!(rm.can_enqueue(&a, t0));
        rm.enqueue(a.clone());

        let b = job(2, 0, t0 + 600, None, 1200, exclusive("sys1"));
        assert!(rm.can_enqueue(&b, t0 + 600));
        rm.enqueue(b.clone());

        assert!(rm.can_start(&b, t0 + 600, TimeSlot::DEFAULT).unwrap());
        assert!(!rm.can_start(&a, t0 + 600, TimeSlot::DEFAULT).unwrap());
    }

    #[test]
    fn ordering_predicate_prefers_start_dated_jobs() {
        let c = job(1, 10, 100, Some(50), 60, exclusive("r"));
        let q = job(2, 0, 0, None, 0, exclusive("r"));
        assert!(precedes(&c, &q));
        assert!(!precedes(&q, &c));
    }

    #[test]
    fn ordering_predicate_tie_breaks_on_priority_then_submit_date() {
        let a = job(1, 0, 100, None, 0, exclusive("r"));
        let b = job(2, 5, 50, None, 0, exclusive("r"));
        assert!(precedes(&a, &b));

        let c = job(3, 0, 100, None, 0, exclusive("r"));
        let d = job(4, 0, 50, None, 0, exclusive("r"));
        assert!(precedes(&d, &c));
    }

    #[test]
    fn can_enqueue_rejects_zero_timeout_with_start_date() {
        let rm = ResourceManager::new(300);
        let job = job(1, 0, 0, Some(1000), 0, exclusive("sys1"));
        assert!(!rm.can_enqueue(&job, 0));
    }

    #[test]
    fn can_enqueue_always_true_without_start_date() {
        let rm = ResourceManager::new(300);
        let job = job(1, 0, 0, None, 100, exclusive("sys1"));
        assert!(rm.can_enqueue(&job, 0));
    }
}
