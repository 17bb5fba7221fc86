mod common;

use common::{booted, image, machine_with, spawn_thread, CODE};
use kernel::{Cpu, KernelConfig, KernelError, SchedPolicy, ThreadId, ThreadState};
use kernel_sync::InterruptControl;
use std::collections::BTreeMap;

#[test]
fn boot_runs_init() {
    let (m, init, tid) = booted(KernelConfig::default());
    assert_eq!(m.kernel.init_pid(), Some(init));
    assert_eq!(m.kernel.current_process(), init);
    assert_eq!(m.kernel.thread_state(tid), Ok(ThreadState::Running));
    assert_eq!(m.cpu.registers().instruction_pointer(), CODE);
    assert!(m.cpu.registers().rflags.interrupt_enable());
    assert_eq!(m.kernel.switch_count(), 1);

    // A second boot is refused.
    assert_eq!(m.kernel.boot(&image()), Err(KernelError::InvalidArgument));
}

#[test]
fn idle_runs_while_nothing_else_can() {
    let m = machine_with(64, KernelConfig::default());
    let idle = m.kernel.current_thread();
    for _ in 0..10 {
        m.kernel.timer_tick();
    }
    assert_eq!(m.kernel.current_thread(), idle);
    assert_eq!(m.kernel.ticks(), 10);
    assert_eq!(m.kernel.switch_count(), 0);
}

#[test]
fn round_robin_is_fair() {
    let slice = 4;
    let (m, init, t1) = booted(KernelConfig::default().with_time_slice(slice));
    let t2 = spawn_thread(&m.kernel, init);
    let t3 = spawn_thread(&m.kernel, init);
    assert_eq!(m.kernel.run_queue(), [t2, t3]);

    let mut ran = Vec::new();
    for _ in 0..36 {
        ran.push(m.kernel.current_thread());
        m.kernel.timer_tick();
    }

    // Nobody runs longer than one slice at a stretch ...
    let mut stretch = 1;
    for pair in ran.windows(2) {
        stretch = if pair[0] == pair[1] { stretch + 1 } else { 1 };
        assert!(stretch <= slice as usize, "{ran:?}");
    }
    // ... and everyone runs within every window of three slices.
    for window in ran.windows(3 * slice as usize) {
        for t in [t1, t2, t3] {
            assert!(window.contains(&t), "{t} starved in {window:?}");
        }
    }
    let mut counts = BTreeMap::new();
    for t in &ran {
        *counts.entry(*t).or_insert(0) += 1;
    }
    assert!(counts.values().all(|c| *c == 12), "{counts:?}");
}

#[test]
fn lone_thread_keeps_the_processor() {
    let (m, _, t1) = booted(KernelConfig::default().with_time_slice(2));
    let switches = m.kernel.switch_count();
    for _ in 0..8 {
        m.kernel.timer_tick();
    }
    assert_eq!(m.kernel.current_thread(), t1);
    assert_eq!(m.kernel.switch_count(), switches);
}

#[test]
fn yield_rotates_and_can_be_directed() {
    let (m, init, t1) = booted(KernelConfig::default());
    let t2 = spawn_thread(&m.kernel, init);
    let t3 = spawn_thread(&m.kernel, init);

    m.kernel.yield_to(Some(t3)).unwrap();
    assert_eq!(m.kernel.current_thread(), t3);
    assert_eq!(m.kernel.thread_state(t1), Ok(ThreadState::Runnable));
    assert_eq!(m.kernel.run_queue(), [t2, t1]);

    m.kernel.yield_now();
    assert_eq!(m.kernel.current_thread(), t2);

    assert_eq!(
        m.kernel.yield_to(Some(ThreadId::new(999))),
        Err(KernelError::NoSuchEntity)
    );
    assert_eq!(m.kernel.current_thread(), t2);
}

#[test]
fn yield_to_a_thread_that_cannot_run_is_a_plain_yield() {
    let (m, init, t1) = booted(KernelConfig::default());
    let t2 = spawn_thread(&m.kernel, init);
    m.kernel.yield_to(Some(t1)).unwrap();
    assert_eq!(m.kernel.current_thread(), t2);
}

#[test]
fn higher_priority_preempts_on_next_tick() {
    let (m, init, t1) = booted(KernelConfig::default().with_policy(SchedPolicy::Priority));
    let t2 = spawn_thread(&m.kernel, init);
    let t3 = spawn_thread(&m.kernel, init);
    m.kernel.set_priority(t3, 1).unwrap();

    m.kernel.timer_tick();
    assert_eq!(m.kernel.current_thread(), t1, "equal priority waits for the slice");

    m.kernel.set_priority(t2, 12).unwrap();
    m.kernel.timer_tick();
    assert_eq!(m.kernel.current_thread(), t2);

    // Lower priorities never preempt, however long t2 runs.
    for _ in 0..20 {
        m.kernel.timer_tick();
    }
    assert_eq!(m.kernel.current_thread(), t2);

    // Once t2 yields, t1 outranks t3.
    m.kernel.yield_now();
    assert_eq!(m.kernel.current_thread(), t2, "t2 still outranks everyone");
    m.kernel.set_priority(t2, 0).unwrap();
    m.kernel.yield_now();
    assert_eq!(m.kernel.current_thread(), t1);
}

#[test]
fn new_threads_inherit_priority() {
    let (m, init, t1) = booted(KernelConfig::default().with_policy(SchedPolicy::Priority));
    m.kernel.set_priority(t1, 3).unwrap();
    let t2 = spawn_thread(&m.kernel, init);
    assert_eq!(m.kernel.priority_of(t2), Ok(3));
    assert_eq!(
        m.kernel.set_priority(ThreadId::new(77), 1),
        Err(KernelError::NoSuchEntity)
    );
}

#[test]
fn context_switch_saves_and_restores_registers() {
    let (m, init, t1) = booted(KernelConfig::default());
    let t2 = spawn_thread(&m.kernel, init);

    m.cpu.with_registers(|r| r.rbx = 0x1111);
    m.kernel.yield_now();
    assert_eq!(m.kernel.current_thread(), t2);
    assert_eq!(m.kernel.saved_context(t1).unwrap().rbx, 0x1111);
    assert_eq!(m.cpu.registers().rbx, 0);

    m.cpu.with_registers(|r| r.rbx = 0x2222);
    m.kernel.yield_now();
    assert_eq!(m.kernel.current_thread(), t1);
    assert_eq!(m.cpu.registers().rbx, 0x1111);
}

#[test]
fn interrupts_are_restored_after_kernel_entry() {
    let (m, init, _) = booted(KernelConfig::default());
    spawn_thread(&m.kernel, init);
    let irq = m.cpu.interrupts();
    let before = m.cpu.interrupt_disables();

    m.kernel.timer_tick();
    m.kernel.yield_now();
    assert!(irq.enabled());
    assert!(m.cpu.interrupt_disables() >= before + 2);
    assert_eq!(m.kernel.run_queue().len(), 1);
}
