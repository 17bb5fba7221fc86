#![allow(dead_code)]

use kernel::{Kernel, KernelConfig, LoadedImage, ProcessId, SimulatedCpu, ThreadId};
use kernel_vmem::info::{PAGE_SIZE, USER_STACK_TOP};
use kernel_vmem::{Backing, HostMemory, Permissions, PhysicalAddress, VirtualAddress};
use std::sync::Arc;

pub const CODE: VirtualAddress = VirtualAddress::new(0x40_0000);
pub const DATA: VirtualAddress = VirtualAddress::new(0x50_0000);
pub const STACK_TOP: VirtualAddress = VirtualAddress::new(USER_STACK_TOP);
pub const UNMAPPED: VirtualAddress = VirtualAddress::new(0x9000_0000);

/// `nop; nop; jmp $`
pub static TEXT: [u8; 4] = [0x90, 0x90, 0xEB, 0xFE];

pub struct Machine {
    pub cpu: Arc<SimulatedCpu>,
    pub memory: Arc<HostMemory>,
    pub kernel: Kernel,
}

/// Code, one data page and a four page lazy stack.
pub fn image() -> LoadedImage<'static> {
    LoadedImage::new(CODE)
        .with_segment(CODE, PAGE_SIZE, Permissions::READ_EXECUTE, Backing::Image(&TEXT))
        .with_segment(DATA, PAGE_SIZE, Permissions::READ_WRITE, Backing::Zeroed)
        .with_stack(STACK_TOP, 4 * PAGE_SIZE)
}

pub fn machine_with(frames: usize, config: KernelConfig) -> Machine {
    let cpu = Arc::new(SimulatedCpu::new());
    let memory = Arc::new(HostMemory::new(PhysicalAddress::new(0x10_0000), frames));
    let map = memory.memory_map();
    let kernel = Kernel::new(config, cpu.clone(), memory.clone(), &map).unwrap();
    Machine {
        cpu,
        memory,
        kernel,
    }
}

/// A kernel that has booted [`image`] as init, which is running.
pub fn booted(config: KernelConfig) -> (Machine, ProcessId, ThreadId) {
    let m = machine_with(256, config);
    let init = m.kernel.boot(&image()).unwrap();
    let tid = m.kernel.current_thread();
    (m, init, tid)
}

/// Adds a thread to `pid` running the image code.
pub fn spawn_thread(k: &Kernel, pid: ProcessId) -> ThreadId {
    k.create_thread(pid, CODE, STACK_TOP, 0).unwrap()
}

pub fn read_user(k: &Kernel, va: VirtualAddress, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    k.user_read(va, &mut buf).unwrap();
    buf
}
