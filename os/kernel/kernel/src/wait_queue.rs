use crate::thread::ThreadId;
use alloc::collections::VecDeque;

/// FIFO of blocked threads attached to one synchronization object or to a
/// parent process's reap event.
///
/// A thread is in at most one wait queue at a time; the owning object's lock
/// guards the queue.
#[derive(Debug, Default)]
pub struct WaitQueue {
    threads: VecDeque<ThreadId>,
}

impl WaitQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            threads: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, tid: ThreadId) {
        debug_assert!(!self.contains(tid), "{tid} queued twice");
        self.threads.push_back(tid);
    }

    /// Re-queues a thread that was woken but lost the race for the
    /// resource, keeping its place ahead of later arrivals.
    pub fn push_front(&mut self, tid: ThreadId) {
        debug_assert!(!self.contains(tid), "{tid} queued twice");
        self.threads.push_front(tid);
    }

    pub fn pop(&mut self) -> Option<ThreadId> {
        self.threads.pop_front()
    }

    /// Removes `tid` wherever it is queued. Returns `false` if it was not.
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        match self.threads.iter().position(|t| *t == tid) {
            Some(index) => {
                self.threads.remove(index);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, tid: ThreadId) -> bool {
        self.threads.contains(&tid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_with_front_requeue() {
        let mut q = WaitQueue::new();
        q.push_back(ThreadId::new(1));
        q.push_back(ThreadId::new(2));
        let first = q.pop().unwrap();
        q.push_back(ThreadId::new(3));
        q.push_front(first);
        let order: alloc::vec::Vec<_> = q.drain().collect();
        assert_eq!(order, [ThreadId::new(1), ThreadId::new(2), ThreadId::new(3)]);
    }

    #[test]
    fn remove_from_middle() {
        let mut q = WaitQueue::new();
        for t in 1..=3 {
            q.push_back(ThreadId::new(t));
        }
        assert!(q.remove(ThreadId::new(2)));
        assert!(!q.remove(ThreadId::new(2)));
        assert_eq!(q.len(), 2);
    }
}
