// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

//! VMM assembly: guest memory, KVM wiring, and module loading — the direct
//! generalization of the teacher's (`virt-do-lumper`) `vmm` crate from a
//! single 64-bit Linux-kernel boot (`lib.rs`/`cpu/mod.rs`/`kernel.rs`'s
//! GDT/page-table/MSR/mptable/cpuid-filter plumbing) to the PC-platform
//! device model and BIOS re-entry trampoline this stack boots instead
//! (spec.md §1, §4.6). The GDT/long-mode/mptable/cpuid-filter machinery is
//! dropped rather than adapted since a real-mode BIOS-booted guest never
//! reaches protected mode through this loader at all; see DESIGN.md.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VmFd};
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion, MemoryRegionAddress};

use devices::PcPlatform;
use msgbus::Motherboard;

pub mod boot;
pub mod config;
mod epoll_context;
mod vcpu;

pub use config::VmmConfig;
pub use vcpu::VcpuThread;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error issuing an ioctl to KVM: {0}")]
    KvmIoctl(#[from] kvm_ioctls::Error),
    #[error("guest memory error: {0}")]
    Memory(String),
    #[error("boot error: {0}")]
    Boot(#[from] boot::Error),
    #[error("vcpu error: {0}")]
    Vcpu(#[from] vcpu::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The rate the in-kernel PIT model is driven at from the host side
/// (spec.md's device models own their own timing; the host thread here
/// only supplies wall-clock pulses, same role the teacher's run loop would
/// have played had it driven a PIT).
const PIT_TICK: Duration = Duration::from_micros(838); // ~1.193182 MHz / 1000, one 8254 tick

pub struct VMM {
    vm_fd: VmFd,
    kvm: Kvm,
    guest_memory: GuestMemoryMmap,
    motherboard: Arc<Motherboard>,
    platform: PcPlatform,
    vcpus: Vec<vcpu::VcpuThread>,
}

impl VMM {
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new()?;
        let vm_fd = kvm.create_vm()?;
        let motherboard = Motherboard::new();
        let platform = PcPlatform::new(&motherboard);

        Ok(VMM { vm_fd, kvm, guest_memory: GuestMemoryMmap::default(), motherboard, platform, vcpus: vec![] })
    }

    pub fn configure_memory(&mut self, mem_size_mb: u32) -> Result<()> {
        let mem_size = (mem_size_mb as usize) << 20;
        let guest_memory =
            GuestMemoryMmap::from_ranges(&[(GuestAddress(0), mem_size)]).map_err(|e| Error::Memory(e.to_string()))?;

        for (slot, region) in guest_memory.iter().enumerate() {
            let host_addr =
                region.get_host_address(MemoryRegionAddress(0)).map_err(|e| Error::Memory(e.to_string()))?;
            let kvm_region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: region.start_addr().0,
                memory_size: region.len(),
                userspace_addr: host_addr as u64,
                flags: 0,
            };
            // SAFETY: host_addr points into guest_memory's own mmap, which
            // outlives vm_fd (owned by the same VMM value).
            unsafe {
                self.vm_fd.set_user_memory_region(kvm_region)?;
            }
        }

        self.guest_memory = guest_memory;
        Ok(())
    }

    pub fn configure_io(&mut self) -> Result<()> {
        self.vm_fd.create_irq_chip()?;
        self.vm_fd.create_pit2(kvm_bindings::kvm_pit_config::default())?;
        Ok(())
    }

    pub fn configure_vcpus(&mut self, num_vcpus: u8, entry_segment: u16) -> Result<()> {
        let base_cpuid = self.kvm.get_supported_cpuid(kvm_bindings::KVM_MAX_CPUID_ENTRIES)?;
        let sregs = boot::real_mode_sregs(entry_segment);

        for index in 0..num_vcpus {
            let vcpu_fd = self.vm_fd.create_vcpu(index as u64)?;
            vcpu_fd.set_cpuid2(&base_cpuid.clone())?;
            vcpu_fd.set_sregs(&sregs)?;

            let mut regs = vcpu_fd.get_regs()?;
            regs.rflags = 0x2;
            regs.rip = 0;
            regs.rsp = boot::BOOT_STACK_POINTER;
            vcpu_fd.set_regs(&regs)?;

            let fpu = kvm_bindings::kvm_fpu { fcw: 0x37f, mxcsr: 0x1f80, ..Default::default() };
            vcpu_fd.set_fpu(&fpu)?;

            self.vcpus.push(vcpu::VcpuThread::new(vcpu_fd, index as u64, self.motherboard.clone(), self.guest_memory.clone()));
        }
        Ok(())
    }

    pub fn configure(&mut self, cfg: &VmmConfig) -> Result<()> {
        self.configure_memory(cfg.memory)?;
        boot::install_bios_trampoline(&self.guest_memory)?;
        boot::load_module(&self.guest_memory, &cfg.module_path, &cfg.module_cmdline, cfg.memory)?;
        self.configure_io()?;
        self.configure_vcpus(cfg.cpus, boot::MODULE_SEGMENT)?;
        Ok(())
    }

    /// Drive the PIT's wall-clock pulses from a background thread for as
    /// long as `vcpus` are running; the PIC/PIT device models own all of
    /// the actual IRQ-line bookkeeping this triggers.
    fn spawn_pit_ticker(&self) -> thread::JoinHandle<()> {
        let pit = self.platform.pit.clone();
        thread::Builder::new()
            .name("pit-tick".into())
            .spawn(move || loop {
                thread::sleep(PIT_TICK);
                pit.lock().unwrap().tick();
            })
            .expect("failed to spawn pit-tick thread")
    }

    /// Run every configured vCPU to completion (each on its own thread,
    /// mirroring the teacher's one-thread-per-vcpu convention), plus a
    /// background PIT ticker and an stdin-to-console bridge.
    pub fn run(&mut self) -> Result<()> {
        let _pit_ticker = self.spawn_pit_ticker();

        let epoll_ctx = epoll_context::EpollContext::new()?;
        epoll_ctx.add_stdin()?;
        let motherboard = self.motherboard.clone();
        thread::Builder::new()
            .name("stdin-console".into())
            .spawn(move || loop {
                if let Err(e) = epoll_ctx.poll_stdin_into_console(&motherboard, 100) {
                    log::warn!("stdin console bridge stopped: {e}");
                    return;
                }
            })
            .map_err(Error::Io)?;

        let mut handles = Vec::new();
        for mut vcpu in std::mem::take(&mut self.vcpus) {
            handles.push(
                thread::Builder::new()
                    .name(format!("vcpu{}", vcpu.index))
                    .spawn(move || {
                        if let Err(e) = vcpu.run() {
                            log::error!("vcpu {}: {e}", vcpu.index);
                        }
                    })
                    .map_err(Error::Io)?,
            );
        }
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}
