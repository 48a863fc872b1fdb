//! Per-vCPU KVM exit loop — the generalization of the teacher's
//! `cpu/mod.rs::Vcpu::run`, which matched `VcpuExit::{IoOut,IoIn,
//! MmioWrite,MmioRead}` against a single hardcoded serial device and a
//! `vm-device` `IoManager`. Here every exit becomes a message posted to the
//! matching `msgbus` bus, and `INT n` trampoline hits are serviced against
//! the `bios` bus (spec.md §4.6) instead of letting the guest's own IVT
//! jump somewhere meaningful, since there is no BIOS ROM behind it.

use std::sync::Arc;

use kvm_ioctls::{VcpuExit, VcpuFd};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use msgbus::{Mmio, Motherboard, PortIo};
use vcpu::bios::{service_int, IretFrame};
use vcpu::core::VcpuCore;

use crate::boot::vector_for_stub_address;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error issuing an ioctl to KVM: {0}")]
    KvmIoctl(#[from] kvm_ioctls::Error),
    #[error("guest memory error: {0}")]
    Memory(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Owns one real KVM vCPU plus the software event/injection state machine
/// `vcpu::core::VcpuCore` tracks alongside it (spec.md §9: "move to a
/// single `Core` value constructed at entry" — here that value sits next
/// to, rather than instead of, the hardware vCPU it shadows).
pub struct VcpuThread {
    pub index: u64,
    vcpu_fd: VcpuFd,
    core: VcpuCore,
    motherboard: Arc<Motherboard>,
    guest_memory: GuestMemoryMmap,
}

const FLAGS_IF: u16 = 1 << 9;
const FLAGS_CF: u16 = 1 << 0;

impl VcpuThread {
    pub fn new(vcpu_fd: VcpuFd, index: u64, motherboard: Arc<Motherboard>, guest_memory: GuestMemoryMmap) -> Self {
        VcpuThread { index, vcpu_fd, core: VcpuCore::new(), motherboard, guest_memory }
    }

    pub fn vcpu_fd(&self) -> &VcpuFd {
        &self.vcpu_fd
    }

    /// Run until the guest shuts down or halts outside the BIOS trampoline.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.vcpu_fd.run()? {
                VcpuExit::Shutdown => {
                    log::info!("vcpu {}: guest shutdown", self.index);
                    return Ok(());
                }
                VcpuExit::Hlt => {
                    if self.service_bios_trampoline()? {
                        continue;
                    }
                    log::info!("vcpu {}: guest halted outside the BIOS trampoline", self.index);
                    return Ok(());
                }
                VcpuExit::IoOut(port, data) => {
                    let mut msg = PortIo { port, write: true, data: pack(data), len: data.len() as u8 };
                    self.motherboard.port_io.send(&mut msg);
                }
                VcpuExit::IoIn(port, data) => {
                    let mut msg = PortIo { port, write: false, data: [0xff; 4], len: data.len() as u8 };
                    self.motherboard.port_io.send(&mut msg);
                    data.copy_from_slice(&msg.data[..data.len()]);
                }
                VcpuExit::MmioWrite(addr, data) => {
                    let mut msg = Mmio { addr, write: true, data: pack8(data), len: data.len() as u8 };
                    self.motherboard.mmio.send(&mut msg);
                }
                VcpuExit::MmioRead(addr, data) => {
                    let mut msg = Mmio { addr, write: false, data: [0xff; 8], len: data.len() as u8 };
                    self.motherboard.mmio.send(&mut msg);
                    data.copy_from_slice(&msg.data[..data.len()]);
                }
                other => {
                    log::warn!("vcpu {}: unhandled VM-exit {:?}", self.index, other);
                }
            }
        }
    }

    /// If the halted `RIP` sits inside the BIOS stub table, service the
    /// interrupt it corresponds to and resume the guest past the `IRET` the
    /// stub would otherwise have executed itself; returns `false` for a
    /// genuine guest halt.
    fn service_bios_trampoline(&mut self) -> Result<bool> {
        let regs = self.vcpu_fd.get_regs()?;
        let sregs = self.vcpu_fd.get_sregs()?;
        let linear = sregs.cs.base + regs.rip;

        let vector = match vector_for_stub_address(linear) {
            Some(v) => v,
            None => return Ok(false),
        };

        let sp = sregs.ss.base + regs.rsp;
        let ip = self.guest_memory.read_obj::<u16>(GuestAddress(sp)).map_err(|e| Error::Memory(e.to_string()))?;
        let cs = self.guest_memory.read_obj::<u16>(GuestAddress(sp + 2)).map_err(|e| Error::Memory(e.to_string()))?;
        let flags = self.guest_memory.read_obj::<u16>(GuestAddress(sp + 4)).map_err(|e| Error::Memory(e.to_string()))?;
        let frame = IretFrame { ip, cs, flags };

        let regs_in = [regs.rax as u16, regs.rbx as u16, regs.rcx as u16, regs.rdx as u16, regs.rsi as u16, regs.rdi as u16];
        let bus = self.motherboard.bios.clone();
        let (regs_out, carry_out) = service_int(&bus, vector, regs_in);

        let mut new_regs = regs;
        new_regs.rax = (regs.rax & !0xffff) | regs_out[0] as u64;
        new_regs.rbx = (regs.rbx & !0xffff) | regs_out[1] as u64;
        new_regs.rcx = (regs.rcx & !0xffff) | regs_out[2] as u64;
        new_regs.rdx = (regs.rdx & !0xffff) | regs_out[3] as u64;
        new_regs.rsi = (regs.rsi & !0xffff) | regs_out[4] as u64;
        new_regs.rdi = (regs.rdi & !0xffff) | regs_out[5] as u64;

        let interrupt_flag_was_set = frame.flags & FLAGS_IF != 0;
        let mut resume_flags = frame.with_restored_if(interrupt_flag_was_set).flags;
        if carry_out {
            resume_flags |= FLAGS_CF;
        } else {
            resume_flags &= !FLAGS_CF;
        }

        new_regs.rip = ip as u64;
        new_regs.rsp = regs.rsp + 6; // popped ip, cs, flags (3 real-mode words)
        new_regs.rflags = (new_regs.rflags & !0xffff) | resume_flags as u64;
        self.vcpu_fd.set_regs(&new_regs)?;

        let mut new_sregs = sregs;
        new_sregs.cs.selector = cs;
        new_sregs.cs.base = (cs as u64) * 16;
        self.vcpu_fd.set_sregs(&new_sregs)?;

        self.core.ack_injection();
        Ok(true)
    }
}

fn pack(data: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[..data.len()].copy_from_slice(data);
    out
}

fn pack8(data: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..data.len()].copy_from_slice(data);
    out
}
