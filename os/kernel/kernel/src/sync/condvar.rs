use super::{Continuation, Mutex};
use crate::Kernel;
use crate::error::KernelError;
use crate::thread::ThreadId;
use crate::wait_queue::WaitQueue;
use alloc::sync::Arc;
use core::task::Poll;
use kernel_sync::SpinLock;

/// Condition variable used together with a [`Mutex`].
pub struct Condvar {
    waiters: SpinLock<WaitQueue>,
}

impl Condvar {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(WaitQueue::new()),
        }
    }

    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Releases `mutex` and blocks `tid` on this condition variable in one
    /// step with respect to [`Self::signal`]: the waiter queue stays locked
    /// from the release until the thread is blocked.
    pub(crate) fn wait(
        self: &Arc<Self>,
        kernel: &Kernel,
        tid: ThreadId,
        mutex: &Arc<Mutex>,
    ) -> Poll<Result<(), KernelError>> {
        let mut waiters = self.waiters.lock();
        let woken = match mutex.unlock(kernel, tid) {
            Ok(woken) => woken,
            Err(e) => return Poll::Ready(Err(e)),
        };
        waiters.push_back(tid);
        kernel.block_current(Continuation::CondWait {
            cond: Arc::clone(self),
            mutex: Arc::clone(mutex),
        });
        if let Some(next) = woken {
            kernel.hand_over(next);
        }
        Poll::Pending
    }

    pub(crate) fn signal(&self, kernel: &Kernel) -> bool {
        kernel.wake_one(&mut self.waiters.lock()).is_some()
    }

    pub(crate) fn broadcast(&self, kernel: &Kernel) -> usize {
        kernel.wake_all(&mut self.waiters.lock())
    }

    /// A signalled waiter that dies before it runs passes the signal on.
    pub(crate) fn cancel(&self, kernel: &Kernel, tid: ThreadId) {
        let mut waiters = self.waiters.lock();
        if !waiters.remove(tid) {
            kernel.wake_one(&mut waiters);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters())
            .finish()
    }
}
