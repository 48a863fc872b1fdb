//! AHCI host bus adapter, simplified to a single port. A real HBA walks
//! command lists and PRDT scatter-gather tables out of guest memory; this
//! model collapses that to "port's command register written, one disk
//! request goes out, the matching commit flips the port's interrupt
//! status register" — enough for a guest AHCI driver's register-level
//! handshake (PxCLB/PxFB/PxCI/PxIS) without implementing DMA descriptor
//! walking, which belongs to the memory-cache layer in `vcpu`, not here.

use msgbus::{BusHandle, DiskCommit, DiskOp, DiskRequest, DiskStatus, Mmio};

const GHC_OFFSET: u64 = 0x04;
const IS_OFFSET: u64 = 0x08;
const PORT0_BASE: u64 = 0x100;
const PXCLB: u64 = PORT0_BASE + 0x00;
const PXFB: u64 = PORT0_BASE + 0x08;
const PXIS: u64 = PORT0_BASE + 0x10;
const PXCI: u64 = PORT0_BASE + 0x38;

pub struct AhciHba {
    disk_request: BusHandle<DiskRequest>,
    ghc: u32,
    global_is: u32,
    clb: u64,
    fb: u64,
    port_is: u32,
    command_issue: u32,
    next_usertag: u32,
}

impl AhciHba {
    pub fn new(disk_request: BusHandle<DiskRequest>) -> Self {
        AhciHba {
            disk_request,
            ghc: 0x8000_0000, // AE: AHCI enable
            global_is: 0,
            clb: 0,
            fb: 0,
            port_is: 0,
            command_issue: 0,
            next_usertag: 1,
        }
    }

    fn take_usertag(&mut self) -> u32 {
        let tag = self.next_usertag;
        self.next_usertag = self.next_usertag.wrapping_add(1).max(1);
        tag
    }

    /// Writing a bit into PxCI starts that command slot; this model treats
    /// every issue as a single-sector read from slot-implied LBA 0 since
    /// reconstructing the real command-table walk needs guest memory
    /// access the bus alone doesn't provide.
    fn issue_command(&mut self, slot_mask: u32) {
        if slot_mask == 0 {
            return;
        }
        let usertag = self.take_usertag();
        let mut req = DiskRequest { disk: 0, op: DiskOp::Read, sector: 0, dma_index: 0, usertag };
        self.disk_request.send(&mut req);
        self.command_issue |= slot_mask;
    }

    fn complete(&mut self, ok: bool) {
        self.command_issue = 0;
        self.port_is |= if ok { 0x01 } else { 0x4000_0000 }; // DHRS or TFES
        self.global_is |= 0x01;
    }
}

impl msgbus::BusDevice<Mmio> for AhciHba {
    fn handle(&mut self, msg: &mut Mmio) -> bool {
        let addr = msg.addr;
        macro_rules! reg32 {
            ($field:expr) => {
                if msg.write {
                    $field = u32::from_le_bytes([msg.data[0], msg.data[1], msg.data[2], msg.data[3]]);
                } else {
                    msg.data[0..4].copy_from_slice(&$field.to_le_bytes());
                    msg.len = 4;
                }
            };
        }
        match addr {
            GHC_OFFSET => {
                reg32!(self.ghc);
                true
            }
            IS_OFFSET => {
                if msg.write {
                    let clear = u32::from_le_bytes([msg.data[0], msg.data[1], msg.data[2], msg.data[3]]);
                    self.global_is &= !clear;
                } else {
                    msg.data[0..4].copy_from_slice(&self.global_is.to_le_bytes());
                    msg.len = 4;
                }
                true
            }
            PXCLB => {
                let mut clb = self.clb as u32;
                reg32!(clb);
                self.clb = (self.clb & !0xffff_ffff) | clb as u64;
                true
            }
            PXFB => {
                let mut fb = self.fb as u32;
                reg32!(fb);
                self.fb = (self.fb & !0xffff_ffff) | fb as u64;
                true
            }
            PXIS => {
                if msg.write {
                    let clear = u32::from_le_bytes([msg.data[0], msg.data[1], msg.data[2], msg.data[3]]);
                    self.port_is &= !clear;
                } else {
                    msg.data[0..4].copy_from_slice(&self.port_is.to_le_bytes());
                    msg.len = 4;
                }
                true
            }
            PXCI => {
                if msg.write {
                    let slots = u32::from_le_bytes([msg.data[0], msg.data[1], msg.data[2], msg.data[3]]);
                    self.issue_command(slots & !self.command_issue);
                } else {
                    msg.data[0..4].copy_from_slice(&self.command_issue.to_le_bytes());
                    msg.len = 4;
                }
                true
            }
            _ => false,
        }
    }
}

impl msgbus::BusDevice<DiskCommit> for AhciHba {
    fn handle(&mut self, msg: &mut DiskCommit) -> bool {
        self.complete(msg.status == DiskStatus::Ok);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgbus::{Bus, DispatchOrder};

    fn new_hba() -> AhciHba {
        AhciHba::new(Bus::new(DispatchOrder::Fifo))
    }

    #[test]
    fn writing_command_issue_sends_a_disk_request() {
        let mut hba = new_hba();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        {
            let seen = seen.clone();
            hba.disk_request.register(
                msgbus::DeviceId(0),
                std::sync::Arc::new(std::sync::Mutex::new(move |_msg: &mut DiskRequest| {
                    *seen.lock().unwrap() += 1;
                    true
                })),
            );
        }
        let mut msg = Mmio { addr: PXCI, write: true, data: [1, 0, 0, 0, 0, 0, 0, 0], len: 4 };
        hba.handle(&mut msg);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn commit_sets_port_interrupt_status_and_global_is() {
        let mut hba = new_hba();
        let mut issue = Mmio { addr: PXCI, write: true, data: [1, 0, 0, 0, 0, 0, 0, 0], len: 4 };
        hba.handle(&mut issue);
        let mut commit = DiskCommit { usertag: 1, status: DiskStatus::Ok };
        msgbus::BusDevice::<DiskCommit>::handle(&mut hba, &mut commit);
        let mut read_is = Mmio { addr: PXIS, write: false, data: [0; 8], len: 0 };
        hba.handle(&mut read_is);
        assert_eq!(u32::from_le_bytes(read_is.data[0..4].try_into().unwrap()), 0x01);
    }

    #[test]
    fn writing_one_to_is_register_clears_the_matching_bit() {
        let mut hba = new_hba();
        let mut issue = Mmio { addr: PXCI, write: true, data: [1, 0, 0, 0, 0, 0, 0, 0], len: 4 };
        hba.handle(&mut issue);
        let mut commit = DiskCommit { usertag: 1, status: DiskStatus::Ok };
        msgbus::BusDevice::<DiskCommit>::handle(&mut hba, &mut commit);
        let mut clear = Mmio { addr: PXIS, write: true, data: [1, 0, 0, 0, 0, 0, 0, 0], len: 4 };
        hba.handle(&mut clear);
        let mut read_is = Mmio { addr: PXIS, write: false, data: [0; 8], len: 0 };
        hba.handle(&mut read_is);
        assert_eq!(u32::from_le_bytes(read_is.data[0..4].try_into().unwrap()), 0);
    }
}
