//! Message payload types for each bus family named in spec.md §4.5.

/// Port-mapped I/O access. `data` holds up to 4 bytes (the widest x86 I/O
/// access); `len` says how many are meaningful. Owned rather than borrowed
/// so a `Bus<PortIo>` handler list can be stored behind a plain `'static`
/// trait object instead of threading a lifetime through the whole fabric.
pub struct PortIo {
    pub port: u16,
    pub write: bool,
    pub data: [u8; 4],
    pub len: u8,
}

/// Memory-mapped I/O access.
pub struct Mmio {
    pub addr: u64,
    pub write: bool,
    pub data: [u8; 8],
    pub len: u8,
}

/// A stable host pointer plus page count handed back by the memory-region
/// bus. Only valid while the guest's page count is unchanged; any
/// `revoke_all_mem` invalidates every outstanding lookup (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct MemRegionGrant {
    pub host_ptr: *mut u8,
    pub pages: usize,
}

// SAFETY seam: the raw pointer above is only ever read by the VCPU core on
// the same host process, behind the TLB/cache layer's own synchronization;
// it never crosses a thread boundary on its own. We still require Send so it
// can travel with a `Mmio`/`MemRegion` message through the bus's handler
// lock.
unsafe impl Send for MemRegionGrant {}

pub enum MemRegion {
    /// Publish: "the guest frame at `gfn` maps to this host range."
    Publish { gfn: u64, pages: usize, grant: MemRegionGrant },
    /// Lookup: resolve a guest frame number to a previously published grant.
    /// Handlers that can answer fill in `result`; the bus is FIFO so the
    /// first subscriber with a match wins and later ones just see it set.
    Lookup { gfn: u64, result: Option<MemRegionGrant> },
    /// Invalidate every outstanding grant (guest page count changed).
    RevokeAll,
}

/// PCI configuration-space access (type-1 `0xcf8`/`0xcfc`, or MMCFG).
pub struct PciConfig {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub offset: u16,
    pub write: bool,
    pub value: u32,
}

/// IRQ line events.
#[derive(Debug, Clone, Copy)]
pub enum Irq {
    Assert(u8),
    Deassert(u8),
    Notify(u8),
}

/// Legacy platform-wide events not tied to a specific IRQ line.
#[derive(Debug, Clone, Copy)]
pub enum LegacyEvent {
    Reset,
    A20 { enabled: bool },
    Intr,
    Nmi,
    Inta { vector_out: u8 },
}

/// Disk request/commit wire, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOp {
    GetParams,
    Read,
    Write,
    FlushCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Ok,
    Busy,
    Device,
    Dma,
    UserTag,
}

pub struct DiskRequest {
    pub disk: usize,
    pub op: DiskOp,
    pub sector: u64,
    pub dma_index: u8,
    pub usertag: u32,
}

pub struct DiskCommit {
    pub usertag: u32,
    pub status: DiskStatus,
}

/// Console events (key input, view switch, lifecycle).
#[derive(Debug, Clone, Copy)]
pub enum Console {
    Key(u8),
    SwitchView(u8),
    Start,
    Kill,
}

/// Discovery bus: devices cooperatively publish/read named ACPI-like blobs
/// (MCFG, FACP, BDA fields, ...).
pub struct Discovery {
    pub resource_name: String,
    pub offset: u32,
    pub bytes: Vec<u8>,
    pub write: bool,
}

/// Host-op: the back channel from device models to the root task.
pub enum HostOp {
    AttachIrq { gsi: u8 },
    AllocIoPort { base: u16, count: u16 },
    AllocIoMem { phys: u64, len: u64 },
    AssignPciDevice { bdf: u16 },
    VirtToPhys { virt: u64, phys_out: u64 },
    RegisterService { name: String, cpu: u32 },
    CreateKernelEc { cpu: u32 },
}

/// BIOS real-mode service call, raised by the VCPU core's re-entry
/// trampoline when the guest executes a real-mode `INT` the hardware
/// doesn't service directly (spec.md §5 names `bios` alongside `hostop` as
/// the two buses a caller may block on). `regs_in`/`regs_out` carry the
/// subset of the real-mode register file the call needs: AX/BX/CX/DX/SI/DI
/// packed as `[ax, bx, cx, dx, si, di]`.
pub struct Bios {
    pub vector: u8,
    pub regs_in: [u16; 6],
    pub regs_out: [u16; 6],
    /// Carry flag on return: BIOS convention for "call failed".
    pub carry_out: bool,
}
