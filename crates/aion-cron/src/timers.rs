//! Timer bookkeeping for the scheduler loop.
//!
//! At most one timer is armed per job. Each job carries an epoch that is
//! bumped on cancel, so a fire that started before an edit can tell on
//! completion that its view of the job is stale.

use std::collections::{BTreeSet, HashMap, HashSet};

/// A timer popped from the queue by [`TimerRegistry::take_due`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTimer {
    pub job_id: String,
    pub fire_at: i64,
    pub epoch: u64,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    /// Ordered by `(fire_at, job_id)` so equal deadlines pop in id order.
    queue: BTreeSet<(i64, String)>,
    armed: HashMap<String, i64>,
    epochs: HashMap<String, u64>,
    in_flight: HashSet<String>,
    /// Jobs whose timer came due while a previous fire was still running.
    deferred: HashSet<String>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer for `job_id`.
    pub fn schedule(&mut self, job_id: &str, fire_at: i64) {
        if let Some(previous) = self.armed.insert(job_id.to_string(), fire_at) {
            self.queue.remove(&(previous, job_id.to_string()));
        }
        self.queue.insert((fire_at, job_id.to_string()));
    }

    /// Disarm the timer for `job_id` and invalidate any fire in flight.
    pub fn cancel(&mut self, job_id: &str) {
        if let Some(previous) = self.armed.remove(job_id) {
            self.queue.remove(&(previous, job_id.to_string()));
        }
        self.deferred.remove(job_id);
        *self.epochs.entry(job_id.to_string()).or_default() += 1;
    }

    /// Drop every trace of a deleted job.
    pub fn forget(&mut self, job_id: &str) {
        self.cancel(job_id);
        self.epochs.remove(job_id);
    }

    pub fn epoch(&self, job_id: &str) -> u64 {
        self.epochs.get(job_id).copied().unwrap_or_default()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<i64> {
        self.queue.first().map(|(at, _)| *at)
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight.contains(job_id)
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.armed.clear();
        self.deferred.clear();
        for epoch in self.epochs.values_mut() {
            *epoch += 1;
        }
    }

    /// Pop every timer due at or before `now` and mark those jobs in flight.
    ///
    /// A job that is still in flight is not returned twice; it is remembered
    /// as deferred and rescheduled when the running fire completes.
    pub fn take_due(&mut self, now: i64) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some((fire_at, job_id)) = self.queue.first().cloned() {
            if fire_at > now {
                break;
            }
            self.queue.pop_first();
            self.armed.remove(&job_id);

            if self.in_flight.contains(&job_id) {
                self.deferred.insert(job_id);
                continue;
            }
            self.in_flight.insert(job_id.clone());
            let epoch = self.epoch(&job_id);
            due.push(DueTimer {
                job_id,
                fire_at,
                epoch,
            });
        }
        due
    }

    /// Mark a fire finished. Returns whether a timer was deferred meanwhile.
    pub fn finish(&mut self, job_id: &str) -> bool {
        self.in_flight.remove(job_id);
        self.deferred.remove(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_replaces_existing() {
        let mut timers = TimerRegistry::new();
        timers.schedule("a", 100);
        timers.schedule("a", 50);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.queue.len(), 1);
        assert_eq!(timers.next_deadline(), Some(50));
    }

    #[test]
    fn test_take_due_orders_by_time_then_id() {
        let mut timers = TimerRegistry::new();
        timers.schedule("c", 10);
        timers.schedule("b", 10);
        timers.schedule("a", 20);
        timers.schedule("z", 5);
        timers.schedule("later", 99);

        let ids: Vec<String> = timers.take_due(20).into_iter().map(|t| t.job_id).collect();
        assert_eq!(ids, vec!["z", "b", "c", "a"]);
        assert_eq!(timers.next_deadline(), Some(99));
        assert!(timers.is_in_flight("b"));
    }

    #[test]
    fn test_cancel_bumps_epoch() {
        let mut timers = TimerRegistry::new();
        timers.schedule("a", 10);
        let due = timers.take_due(10);
        assert_eq!(due[0].epoch, 0);

        timers.cancel("a");
        assert_eq!(timers.epoch("a"), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_in_flight_job_is_deferred() {
        let mut timers = TimerRegistry::new();
        timers.schedule("a", 10);
        assert_eq!(timers.take_due(10).len(), 1);

        timers.schedule("a", 11);
        assert!(timers.take_due(20).is_empty());
        assert!(timers.finish("a"));
        assert!(!timers.is_in_flight("a"));
        assert!(!timers.finish("a"));
    }

    #[test]
    fn test_clear_invalidates_epochs() {
        let mut timers = TimerRegistry::new();
        timers.schedule("a", 10);
        timers.cancel("a");
        timers.schedule("a", 10);
        timers.clear();
        assert!(timers.is_empty());
        assert_eq!(timers.epoch("a"), 2);
        assert_eq!(timers.next_deadline(), None);
    }
}
