use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sync::{lock, wait_timeout};
use crate::work::WorkUnit;

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<WorkUnit>,
    frozen: bool,
}

/// Per-device FIFO handoff between the controller and a device's workers.
///
/// While frozen, pushes are refused and pops return immediately empty;
/// queued units stay put until thawed or flushed.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands the unit back if the queue is frozen.
    pub fn push(&self, unit: WorkUnit) -> Result<(), WorkUnit> {
        debug_assert!(!unit.is_mined(), "unit {} already handed to a worker", unit.id());
        let mut inner = lock(&self.inner);
        if inner.frozen {
            return Err(unit);
        }
        inner.items.push_back(unit);
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// Waits up to `timeout` for a unit.
    pub fn pop(&self, timeout: Duration) -> Option<WorkUnit> {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            if inner.frozen {
                return None;
            }
            if let Some(unit) = inner.items.pop_front() {
                return Some(unit);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = wait_timeout(&self.cond, inner, deadline - now);
            inner = guard;
        }
    }

    pub fn freeze(&self) {
        lock(&self.inner).frozen = true;
        self.cond.notify_all();
    }

    pub fn thaw(&self) {
        lock(&self.inner).frozen = false;
        self.cond.notify_all();
    }

    pub fn is_frozen(&self) -> bool {
        lock(&self.inner).frozen
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything queued, oldest first.
    pub fn flush(&self) -> Vec<WorkUnit> {
        lock(&self.inner).items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{easy_work, test_pool};
    use crate::work::WorkFactory;
    use std::sync::Arc;
    use std::thread;

    fn units(n: usize) -> Vec<WorkUnit> {
        let f = WorkFactory::new(0, Duration::from_secs(60));
        let pool = test_pool(0);
        (0..n).map(|i| f.create(easy_work(i as u8, false), Arc::clone(&pool), 0)).collect()
    }

    #[test]
    fn delivers_each_unit_once_in_push_order() {
        let q = WorkQueue::new();
        let pushed: Vec<u64> = units(5)
            .into_iter()
            .map(|u| {
                let id = u.id();
                q.push(u).unwrap();
                id
            })
            .collect();
        let popped: Vec<u64> = std::iter::from_fn(|| q.pop(Duration::from_millis(1)))
            .map(|u| u.id())
            .collect();
        assert_eq!(popped, pushed);
        assert!(q.pop(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn interleaved_push_pop_keeps_order() {
        let q = WorkQueue::new();
        let mut all = units(6).into_iter();
        let mut popped = Vec::new();
        let mut pushed = Vec::new();
        for round in 0..3 {
            for _ in 0..2 {
                let u = all.next().unwrap();
                pushed.push(u.id());
                q.push(u).unwrap();
            }
            if round < 2 {
                popped.push(q.pop(Duration::ZERO).unwrap().id());
            }
        }
        while let Some(u) = q.pop(Duration::ZERO) {
            popped.push(u.id());
        }
        assert_eq!(popped, pushed);
    }

    #[test]
    fn frozen_queue_refuses_push_and_pops_empty_without_waiting() {
        let q = WorkQueue::new();
        let mut us = units(2);
        q.push(us.remove(0)).unwrap();
        q.freeze();

        let start = Instant::now();
        assert!(q.pop(Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));

        let refused = q.push(us.remove(0)).unwrap_err();
        assert_eq!(q.len(), 1);
        drop(refused);

        q.thaw();
        assert!(q.pop(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn freeze_wakes_a_blocked_pop() {
        let q = Arc::new(WorkQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let start = Instant::now();
                let got = q.pop(Duration::from_secs(10));
                (got.is_none(), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        q.freeze();
        let (empty, waited) = waiter.join().unwrap();
        assert!(empty);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn bounded_wait_then_delivery_from_another_thread() {
        let q = Arc::new(WorkQueue::new());
        let start = Instant::now();
        assert!(q.pop(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));

        let producer = {
            let q = Arc::clone(&q);
            let u = units(1).pop().unwrap();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(u).unwrap();
            })
        };
        assert!(q.pop(Duration::from_secs(5)).is_some());
        producer.join().unwrap();
    }

    #[test]
    fn flush_drains_without_freezing() {
        let q = WorkQueue::new();
        for u in units(3) {
            q.push(u).unwrap();
        }
        assert_eq!(q.flush().len(), 3);
        assert!(q.is_empty());
        assert!(!q.is_frozen());
    }
}
