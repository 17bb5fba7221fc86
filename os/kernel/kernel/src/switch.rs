//! # Context switch
//!
//! The only code that changes which thread's registers are loaded on the
//! processor. Called by the scheduler with no short-section lock held.

use crate::Kernel;
use crate::config::KERNEL_PID;
use crate::cpu::{Context, USER_CS, USER_SS};
use crate::error::halt;
use crate::thread::ThreadId;

impl Kernel {
    /// Copies the live registers into the control block of `from`.
    pub(crate) fn save_context(&self, from: ThreadId) {
        let mut context = Context::default();
        self.cpu.save(&mut context);
        let _ = self.threads.with(from, |t| t.context = context);
    }

    /// Loads the address space and registers of `to`.
    ///
    /// `from` has been saved by [`Kernel::save_context`] beforehand.
    pub(crate) fn switch_to(&self, from: ThreadId, to: ThreadId) {
        let Ok((context, pid)) = self.threads.with(to, |t| (t.context, t.pid)) else {
            halt(format_args!("switch to {to} without a control block"));
        };
        if pid != KERNEL_PID && (context.cs != USER_CS || context.ss != USER_SS) {
            halt(format_args!(
                "corrupted context for {to}: cs={:#x} ss={:#x}",
                context.cs, context.ss
            ));
        }

        let root = self.root_of(pid);
        if self.cpu.active_root() != root {
            self.cpu.activate(root);
        }
        self.cpu.restore(&context);

        if from != to {
            self.sched.lock().switches += 1;
            log::trace!(
                "switch {from} -> {to} ({pid}) at {}",
                context.instruction_pointer()
            );
        }
    }
}
