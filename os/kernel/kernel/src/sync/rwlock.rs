use super::Continuation;
use crate::Kernel;
use crate::error::KernelError;
use crate::thread::ThreadId;
use crate::wait_queue::WaitQueue;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use core::task::Poll;
use kernel_sync::SpinLock;

/// Reader-writer lock that bounds writer starvation.
///
/// While a writer waits, at most `batch` further readers are admitted
/// before the writer gets the lock. A releasing writer lets queued readers
/// in first (up to the batch) and otherwise wakes the next writer; the last
/// reader out wakes a writer.
pub struct RwLock {
    batch: usize,
    state: SpinLock<RwState>,
}

struct RwState {
    writer: Option<ThreadId>,
    readers: BTreeSet<ThreadId>,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
    /// Writers queued or woken but not yet holding the lock.
    writers_pending: usize,
    /// Readers admitted since a writer started waiting.
    admitted: usize,
}

impl RwState {
    fn holds(&self, tid: ThreadId) -> bool {
        self.writer == Some(tid)
    }

    fn admits_reader(&self, batch: usize) -> bool {
        self.writer.is_none() && (self.writers_pending == 0 || self.admitted < batch)
    }

    fn admit_reader(&mut self, tid: ThreadId) {
        if self.writers_pending > 0 {
            self.admitted += 1;
        }
        self.readers.insert(tid);
    }

    fn writer_gone(&mut self) {
        self.writers_pending = self.writers_pending.saturating_sub(1);
        if self.writers_pending == 0 {
            self.admitted = 0;
        }
    }
}

impl RwLock {
    /// `batch` is clamped to at least one reader.
    #[must_use]
    pub const fn new(batch: usize) -> Self {
        Self {
            batch: if batch == 0 { 1 } else { batch },
            state: SpinLock::new(RwState {
                writer: None,
                readers: BTreeSet::new(),
                read_waiters: WaitQueue::new(),
                write_waiters: WaitQueue::new(),
                writers_pending: 0,
                admitted: 0,
            }),
        }
    }

    #[must_use]
    pub fn readers(&self) -> usize {
        self.state.lock().readers.len()
    }

    #[must_use]
    pub fn writer(&self) -> Option<ThreadId> {
        self.state.lock().writer
    }

    /// Blocked readers and writers.
    #[must_use]
    pub fn waiters(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.read_waiters.len(), state.write_waiters.len())
    }

    pub(crate) fn read(
        self: &Arc<Self>,
        kernel: &Kernel,
        tid: ThreadId,
        retry: bool,
    ) -> Poll<Result<(), KernelError>> {
        let mut state = self.state.lock();
        if state.holds(tid) || state.readers.contains(&tid) {
            return Poll::Ready(Err(KernelError::Deadlock));
        }
        if state.admits_reader(self.batch) {
            state.admit_reader(tid);
            return Poll::Ready(Ok(()));
        }
        if retry {
            state.read_waiters.push_front(tid);
        } else {
            state.read_waiters.push_back(tid);
        }
        kernel.block_current(Continuation::ReadLock(Arc::clone(self)));
        Poll::Pending
    }

    pub(crate) fn write(
        self: &Arc<Self>,
        kernel: &Kernel,
        tid: ThreadId,
        retry: bool,
    ) -> Poll<Result<(), KernelError>> {
        let mut state = self.state.lock();
        if state.holds(tid) || state.readers.contains(&tid) {
            return Poll::Ready(Err(KernelError::Deadlock));
        }
        if state.writer.is_none() && state.readers.is_empty() {
            if retry {
                state.writer_gone();
            }
            state.writer = Some(tid);
            state.admitted = 0;
            return Poll::Ready(Ok(()));
        }
        if retry {
            state.write_waiters.push_front(tid);
        } else {
            state.writers_pending += 1;
            state.write_waiters.push_back(tid);
        }
        kernel.block_current(Continuation::WriteLock(Arc::clone(self)));
        Poll::Pending
    }

    pub(crate) fn unlock(&self, kernel: &Kernel, tid: ThreadId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.holds(tid) {
            state.writer = None;
            self.wake_next(kernel, &mut state);
            return Ok(());
        }
        if state.readers.remove(&tid) {
            if state.readers.is_empty() {
                kernel.wake_one(&mut state.write_waiters);
            }
            return Ok(());
        }
        log::warn!("{tid} releasing reader-writer lock it does not hold");
        Err(KernelError::NotOwner)
    }

    pub(crate) fn downgrade(&self, kernel: &Kernel, tid: ThreadId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if !state.holds(tid) {
            return Err(KernelError::NotOwner);
        }
        state.writer = None;
        state.readers.insert(tid);
        self.wake_readers(kernel, &mut state);
        Ok(())
    }

    /// Wakes as many queued readers as can be admitted.
    fn wake_readers(&self, kernel: &Kernel, state: &mut RwState) {
        let room = if state.writers_pending == 0 {
            state.read_waiters.len()
        } else {
            self.batch.saturating_sub(state.admitted)
        };
        for _ in 0..room {
            if kernel.wake_one(&mut state.read_waiters).is_none() {
                break;
            }
        }
    }

    /// Wakes whoever can go next on a lock without a writer: the readers
    /// that fit, or else a writer once no reader holds the lock.
    fn wake_next(&self, kernel: &Kernel, state: &mut RwState) {
        if state.writer.is_some() {
            return;
        }
        if !state.read_waiters.is_empty() && state.admits_reader(self.batch) {
            self.wake_readers(kernel, state);
        } else if state.readers.is_empty() {
            kernel.wake_one(&mut state.write_waiters);
        }
    }

    pub(crate) fn cancel_read(&self, kernel: &Kernel, tid: ThreadId) {
        let mut state = self.state.lock();
        if !state.read_waiters.remove(tid) {
            self.wake_next(kernel, &mut state);
        }
    }

    /// Withdraws a writer. If it was the last one pending, readers held
    /// back on its behalf are let in; a woken writer hands its turn on.
    pub(crate) fn cancel_write(&self, kernel: &Kernel, tid: ThreadId) {
        let mut state = self.state.lock();
        let queued = state.write_waiters.remove(tid);
        state.writer_gone();
        if !queued || state.writers_pending == 0 {
            self.wake_next(kernel, &mut state);
        }
    }
}

impl core::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RwLock")
            .field("writer", &state.writer)
            .field("readers", &state.readers.len())
            .field("writers_pending", &state.writers_pending)
            .finish_non_exhaustive()
    }
}
