mod common;

use common::{booted, spawn_thread, Machine, DATA, UNMAPPED};
use kernel::{Completion, KernelConfig, KernelError, ProcessState, Sysno, ThreadState};
use kernel_vmem::info::PAGE_SIZE;
use kernel_vmem::VirtualAddress;
use std::task::Poll;

/// Stages a system call in the live registers and traps into the kernel.
fn call(m: &Machine, sysno: Sysno, args: &[u64]) -> Poll<Completion> {
    m.cpu.with_registers(|r| {
        r.rax = sysno as u64;
        let slots = [&mut r.rdi, &mut r.rsi, &mut r.rdx, &mut r.r10, &mut r.r8, &mut r.r9];
        for (slot, arg) in slots.into_iter().zip(args) {
            *slot = *arg;
        }
    });
    m.kernel.syscall()
}

const fn code(e: KernelError) -> u64 {
    e.code().cast_unsigned()
}

#[test]
fn results_land_in_the_return_registers() {
    let (m, p1, t1) = booted(KernelConfig::default());
    assert_eq!(call(&m, Sysno::GetPid, &[]), Poll::Ready(Ok((p1.as_u64(), 0))));
    assert_eq!(m.cpu.registers().rax, p1.as_u64());
    assert_eq!(call(&m, Sysno::GetTid, &[]), Poll::Ready(Ok((t1.as_u64(), 0))));
    assert_eq!(m.cpu.registers().rax, t1.as_u64());
}

#[test]
fn unknown_numbers_are_rejected() {
    let (m, _, _) = booted(KernelConfig::default());
    m.cpu.with_registers(|r| r.rax = 12);
    assert_eq!(
        m.kernel.syscall(),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );
    assert_eq!(m.cpu.registers().rax, code(KernelError::InvalidArgument));
}

#[test]
fn fork_returns_twice() {
    let (m, _, _) = booted(KernelConfig::default());
    let Poll::Ready(Ok((child, _))) = call(&m, Sysno::Fork, &[]) else {
        panic!("fork failed");
    };
    assert_eq!(m.cpu.registers().rax, child);

    let child = kernel::ProcessId::new(child);
    let child_tid = m.kernel.threads_of(child).unwrap()[0];
    assert_eq!(m.kernel.saved_context(child_tid).unwrap().rax, 0);

    assert_eq!(call(&m, Sysno::Yield, &[child_tid.as_u64()]), Poll::Ready(Ok((0, 0))));
    assert_eq!(m.kernel.current_thread(), child_tid);
    assert_eq!(m.cpu.registers().rax, 0);
}

#[test]
fn exit_and_wait_through_the_trap() {
    let (m, p1, t1) = booted(KernelConfig::default());
    let Poll::Ready(Ok((child, _))) = call(&m, Sysno::Fork, &[]) else {
        panic!("fork failed");
    };

    // The parent blocks; the child exits with a negative status.
    assert_eq!(call(&m, Sysno::Wait, &[]), Poll::Pending);
    assert_eq!(m.kernel.current_process().as_u64(), child);
    assert_eq!(call(&m, Sysno::Exit, &[(-1i64).cast_unsigned()]), Poll::Pending);

    assert_eq!(m.kernel.current_thread(), t1);
    assert_eq!(m.kernel.current_process(), p1);
    assert_eq!(
        m.cpu.registers().return_values(),
        (child, (-1i64).cast_unsigned())
    );
    assert_eq!(call(&m, Sysno::Wait, &[]), Poll::Ready(Err(KernelError::NoSuchEntity)));
}

#[test]
fn mutex_through_the_trap() {
    let (m, init, t1) = booted(KernelConfig::default());
    let t2 = spawn_thread(&m.kernel, init);
    let Poll::Ready(Ok((mutex, _))) = call(&m, Sysno::MutexCreate, &[]) else {
        panic!("mutex_create failed");
    };

    assert_eq!(call(&m, Sysno::MutexLock, &[mutex]), Poll::Ready(Ok((0, 0))));
    assert_eq!(
        call(&m, Sysno::MutexLock, &[mutex]),
        Poll::Ready(Err(KernelError::Deadlock))
    );
    assert_eq!(m.cpu.registers().rax, code(KernelError::Deadlock));

    m.kernel.yield_to(Some(t2)).unwrap();
    assert_eq!(call(&m, Sysno::MutexTryLock, &[mutex]), Poll::Ready(Ok((0, 0))));
    assert_eq!(call(&m, Sysno::MutexLock, &[mutex]), Poll::Pending);
    assert_eq!(m.kernel.current_thread(), t1);

    // Unlocking switches to t2, which now owns the mutex; t1's result is
    // waiting in its saved registers.
    m.cpu.with_registers(|r| r.rbx = 0xfeed);
    assert_eq!(call(&m, Sysno::MutexUnlock, &[mutex]), Poll::Ready(Ok((0, 0))));
    assert_eq!(m.kernel.current_thread(), t2);
    assert_eq!(m.cpu.registers().rax, 0);
    let saved = m.kernel.saved_context(t1).unwrap();
    assert_eq!((saved.rax, saved.rbx), (0, 0xfeed));

    assert_eq!(
        call(&m, Sysno::SemUp, &[mutex]),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );
    assert_eq!(
        call(&m, Sysno::MutexUnlock, &[999]),
        Poll::Ready(Err(KernelError::NoSuchEntity))
    );
}

#[test]
fn objects_are_private_to_their_process() {
    let (m, _, _) = booted(KernelConfig::default());
    let Poll::Ready(Ok((sem, _))) = call(&m, Sysno::SemCreate, &[1]) else {
        panic!("sem_create failed");
    };
    assert_eq!(call(&m, Sysno::SemTryDown, &[sem]), Poll::Ready(Ok((1, 0))));
    assert_eq!(call(&m, Sysno::SemTryDown, &[sem]), Poll::Ready(Ok((0, 0))));

    let Poll::Ready(Ok((child, _))) = call(&m, Sysno::Fork, &[]) else {
        panic!("fork failed");
    };
    let child_tid = m
        .kernel
        .threads_of(kernel::ProcessId::new(child))
        .unwrap()[0];
    m.kernel.yield_to(Some(child_tid)).unwrap();
    assert_eq!(
        call(&m, Sysno::SemUp, &[sem]),
        Poll::Ready(Err(KernelError::NoSuchEntity))
    );
}

#[test]
fn debug_write_checks_the_buffer() {
    let (m, init, _) = booted(KernelConfig::default());
    m.kernel.user_write(DATA, b"hello").unwrap();
    assert_eq!(
        call(&m, Sysno::DebugWrite, &[DATA.as_u64(), 5]),
        Poll::Ready(Ok((5, 0)))
    );

    // A bad pointer is an error for the caller, not a fault.
    assert_eq!(
        call(&m, Sysno::DebugWrite, &[UNMAPPED.as_u64(), 4]),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );
    assert_eq!(
        call(&m, Sysno::DebugWrite, &[DATA.as_u64(), 64 * PAGE_SIZE]),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );
    assert_eq!(m.kernel.process_state(init), Ok(ProcessState::Alive));
}

#[test]
fn anonymous_mappings() {
    let (m, init, _) = booted(KernelConfig::default());
    let base = VirtualAddress::new(0x80_0000);
    let read_write = 0b011;

    assert_eq!(
        call(&m, Sysno::MemoryMap, &[base.as_u64(), 2 * PAGE_SIZE, read_write]),
        Poll::Ready(Ok((0, 0)))
    );
    assert_eq!(m.kernel.translate(init, base), Ok(None));
    m.kernel.user_write(base, b"mapped").unwrap();
    assert!(m.kernel.translate(init, base).unwrap().is_some());

    assert_eq!(
        call(&m, Sysno::MemoryMap, &[base.as_u64(), PAGE_SIZE, read_write]),
        Poll::Ready(Err(KernelError::Overlap))
    );
    assert_eq!(
        call(&m, Sysno::MemoryMap, &[0x90_0000, PAGE_SIZE, 0b1000]),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );

    let free = m.kernel.free_frames();
    assert_eq!(
        call(&m, Sysno::MemoryUnmap, &[base.as_u64(), 2 * PAGE_SIZE]),
        Poll::Ready(Ok((0, 0)))
    );
    assert_eq!(m.kernel.free_frames(), free + 1);
    assert_eq!(m.kernel.translate(init, base), Ok(None));
}

#[test]
fn deschedule_parks_until_made_runnable() {
    let (m, init, t1) = booted(KernelConfig::default());
    let t2 = spawn_thread(&m.kernel, init);

    // A set reject word returns at once.
    m.kernel.user_write(DATA, &1u32.to_ne_bytes()).unwrap();
    assert_eq!(call(&m, Sysno::Deschedule, &[DATA.as_u64()]), Poll::Ready(Ok((0, 0))));
    assert_eq!(m.kernel.current_thread(), t1);

    m.kernel.user_write(DATA, &0u32.to_ne_bytes()).unwrap();
    assert_eq!(call(&m, Sysno::Deschedule, &[DATA.as_u64()]), Poll::Pending);
    assert_eq!(m.kernel.current_thread(), t2);
    assert_eq!(m.kernel.thread_state(t1), Ok(ThreadState::Blocked));

    // Only a descheduled thread can be made runnable, and only once.
    assert_eq!(
        call(&m, Sysno::MakeRunnable, &[t2.as_u64()]),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );
    assert_eq!(call(&m, Sysno::MakeRunnable, &[t1.as_u64()]), Poll::Ready(Ok((0, 0))));
    assert_eq!(m.kernel.thread_state(t1), Ok(ThreadState::Runnable));
    assert_eq!(
        call(&m, Sysno::MakeRunnable, &[t1.as_u64()]),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );

    m.kernel.yield_now();
    assert_eq!(m.kernel.current_thread(), t1);
    assert_eq!(m.kernel.take_completion(t1), Some(Ok((0, 0))));
    assert_eq!(m.cpu.registers().rax, 0);

    assert_eq!(
        call(&m, Sysno::Deschedule, &[UNMAPPED.as_u64()]),
        Poll::Ready(Err(KernelError::InvalidArgument))
    );
}
