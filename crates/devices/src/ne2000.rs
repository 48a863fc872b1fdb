//! NE2000-compatible (DP8390 + 8390 ring buffer) NIC register model, ports
//! 0x300-0x31f. Host-side packet delivery (the actual tap/bridge plumbing)
//! is `vmm`'s concern, not this crate's; this model only gets the command,
//! interrupt, and remote-DMA register state machine right so a guest NIC
//! driver's probe and ring-buffer bookkeeping behave. `deliver_rx` is the
//! seam `vmm` calls when a host packet arrives.

use msgbus::{Irq, PortIo};

const CR: u16 = 0x00;
const PSTART: u16 = 0x01;
const PSTOP: u16 = 0x02;
const BOUNDARY: u16 = 0x03;
const TPSR: u16 = 0x04;
const ISR: u16 = 0x07;
const RSAR0: u16 = 0x08;
const RSAR1: u16 = 0x09;
const RBCR0: u16 = 0x0a;
const RBCR1: u16 = 0x0b;
const IMR: u16 = 0x0f;
const DATA_PORT: u16 = 0x10;
const RESET_PORT: u16 = 0x1f;

const CR_STOP: u8 = 0x01;
const CR_START: u8 = 0x02;
const CR_RD_MASK: u8 = 0x38;
const CR_RD_REMOTE_READ: u8 = 0x08;
const CR_RD_REMOTE_WRITE: u8 = 0x10;

const ISR_PRX: u8 = 0x01; // packet received
const ISR_PTX: u8 = 0x02; // packet transmitted
const ISR_RDC: u8 = 0x40; // remote DMA complete

pub struct Ne2000 {
    ram: [u8; 16 * 1024],
    command: u8,
    page: u8,
    pstart: u8,
    pstop: u8,
    boundary: u8,
    isr: u8,
    imr: u8,
    remote_addr: u16,
    remote_count: u16,
    irq: msgbus::BusHandle<Irq>,
    gsi: u8,
}

impl Ne2000 {
    pub fn new(irq: msgbus::BusHandle<Irq>, gsi: u8) -> Self {
        Ne2000 {
            ram: [0; 16 * 1024],
            command: CR_STOP,
            page: 0,
            pstart: 0x46,
            pstop: 0x80,
            boundary: 0x46,
            isr: 0,
            imr: 0,
            remote_addr: 0,
            remote_count: 0,
            irq,
            gsi,
        }
    }

    fn maybe_raise_irq(&mut self) {
        if self.isr & self.imr != 0 {
            let mut assert = Irq::Assert(self.gsi);
            self.irq.send(&mut assert);
        }
    }

    /// Host-side injection of a received frame into the ring buffer,
    /// called by `vmm`'s network backend, not by the guest.
    pub fn deliver_rx(&mut self, frame: &[u8]) {
        let offset = (self.boundary as usize) * 256;
        let end = (offset + frame.len()).min(self.ram.len());
        let copy_len = end.saturating_sub(offset);
        self.ram[offset..offset + copy_len].copy_from_slice(&frame[..copy_len]);
        self.isr |= ISR_PRX;
        self.maybe_raise_irq();
    }

    fn write_reg(&mut self, reg: u16, value: u8) {
        match reg {
            CR => self.command = value,
            PSTART => self.pstart = value,
            PSTOP => self.pstop = value,
            BOUNDARY => self.boundary = value,
            ISR => self.isr &= !value, // write-1-to-clear
            RSAR0 => self.remote_addr = (self.remote_addr & 0xff00) | value as u16,
            RSAR1 => self.remote_addr = (self.remote_addr & 0x00ff) | (value as u16) << 8,
            RBCR0 => self.remote_count = (self.remote_count & 0xff00) | value as u16,
            RBCR1 => self.remote_count = (self.remote_count & 0x00ff) | (value as u16) << 8,
            IMR => self.imr = value,
            _ => {}
        }
    }

    fn read_reg(&self, reg: u16) -> u8 {
        match reg {
            CR => self.command,
            PSTART => self.pstart,
            PSTOP => self.pstop,
            BOUNDARY => self.boundary,
            ISR => self.isr,
            RSAR0 => self.remote_addr as u8,
            RSAR1 => (self.remote_addr >> 8) as u8,
            RBCR0 => self.remote_count as u8,
            RBCR1 => (self.remote_count >> 8) as u8,
            IMR => self.imr,
            TPSR => 0,
            _ => 0xff,
        }
    }

    fn data_port_read(&mut self) -> u8 {
        if self.command & CR_RD_MASK != CR_RD_REMOTE_READ || self.remote_count == 0 {
            return 0xff;
        }
        let byte = self.ram[self.remote_addr as usize % self.ram.len()];
        self.remote_addr = self.remote_addr.wrapping_add(1);
        self.remote_count -= 1;
        if self.remote_count == 0 {
            self.isr |= ISR_RDC;
        }
        byte
    }

    fn data_port_write(&mut self, value: u8) {
        if self.command & CR_RD_MASK != CR_RD_REMOTE_WRITE || self.remote_count == 0 {
            return;
        }
        let idx = self.remote_addr as usize % self.ram.len();
        self.ram[idx] = value;
        self.remote_addr = self.remote_addr.wrapping_add(1);
        self.remote_count -= 1;
        if self.remote_count == 0 {
            self.isr |= ISR_RDC;
        }
    }
}

impl msgbus::BusDevice<PortIo> for Ne2000 {
    fn handle(&mut self, msg: &mut PortIo) -> bool {
        let reg = msg.port.wrapping_sub(0x300);
        match reg {
            RESET_PORT => {
                if !msg.write {
                    self.command = CR_STOP;
                    msg.data[0] = 0;
                    msg.len = 1;
                }
                true
            }
            DATA_PORT => {
                if msg.write {
                    self.data_port_write(msg.data[0]);
                } else {
                    msg.data[0] = self.data_port_read();
                    msg.len = 1;
                }
                true
            }
            0x00..=0x0f => {
                if msg.write {
                    self.write_reg(reg, msg.data[0]);
                    self.maybe_raise_irq();
                } else {
                    msg.data[0] = self.read_reg(reg);
                    msg.len = 1;
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgbus::{Bus, DispatchOrder};

    fn new_nic() -> Ne2000 {
        Ne2000::new(Bus::new(DispatchOrder::Fifo), 9)
    }

    fn io(nic: &mut Ne2000, port: u16, write: bool, value: u8) -> PortIo {
        let mut msg = PortIo { port, write, data: [value, 0, 0, 0], len: 1 };
        nic.handle(&mut msg);
        msg
    }

    #[test]
    fn reset_port_stops_the_card() {
        let mut nic = new_nic();
        io(&mut nic, 0x300 + CR, true, CR_START);
        io(&mut nic, 0x300 + RESET_PORT, false, 0);
        assert_eq!(nic.command, CR_STOP);
    }

    #[test]
    fn remote_dma_write_then_read_round_trips_through_ring_ram() {
        let mut nic = new_nic();
        io(&mut nic, 0x300 + RSAR0, true, 0x00);
        io(&mut nic, 0x300 + RSAR1, true, 0x10);
        io(&mut nic, 0x300 + RBCR0, true, 0x02);
        io(&mut nic, 0x300 + RBCR1, true, 0x00);
        io(&mut nic, 0x300 + CR, true, CR_RD_REMOTE_WRITE);
        io(&mut nic, 0x300 + DATA_PORT, true, 0xaa);
        io(&mut nic, 0x300 + DATA_PORT, true, 0xbb);

        io(&mut nic, 0x300 + RSAR0, true, 0x00);
        io(&mut nic, 0x300 + RSAR1, true, 0x10);
        io(&mut nic, 0x300 + RBCR0, true, 0x02);
        io(&mut nic, 0x300 + RBCR1, true, 0x00);
        io(&mut nic, 0x300 + CR, true, CR_RD_REMOTE_READ);
        let a = io(&mut nic, 0x300 + DATA_PORT, false, 0);
        let b = io(&mut nic, 0x300 + DATA_PORT, false, 0);
        assert_eq!(a.data[0], 0xaa);
        assert_eq!(b.data[0], 0xbb);
    }

    #[test]
    fn deliver_rx_sets_prx_and_raises_irq_when_unmasked() {
        let mut nic = new_nic();
        io(&mut nic, 0x300 + IMR, true, ISR_PRX);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            nic.irq.register(
                msgbus::DeviceId(0),
                std::sync::Arc::new(std::sync::Mutex::new(move |msg: &mut Irq| {
                    seen.lock().unwrap().push(*msg);
                    true
                })),
            );
        }
        nic.deliver_rx(&[1, 2, 3]);
        assert_eq!(nic.isr & ISR_PRX, ISR_PRX);
        assert!(matches!(seen.lock().unwrap()[0], Irq::Assert(9)));
    }
}
