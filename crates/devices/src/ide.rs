//! IDE controller (primary channel only; ports 0x1f0-0x1f7 plus the
//! alternate status/device control register at 0x3f6), bridging PIO
//! register accesses to the `disk_request`/`disk_commit` buses (spec.md
//! §6's disk wire). A real controller pulls data over DMA or PIO loops
//! driven by IRQ14; here the translation from "guest issued READ SECTORS"
//! to "disk_request went out, disk_commit came back" is synchronous within
//! one `send()` call, since the buses this repo models dispatch
//! handlers inline rather than across a real I/O scheduler.

use msgbus::{BusHandle, DiskCommit, DiskOp, DiskRequest, DiskStatus, Irq, PortIo};

const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_DRDY: u8 = 0x40;
const STATUS_BSY: u8 = 0x80;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xec;

const SECTOR_WORDS: usize = 256;

pub struct IdeChannel {
    disk_request: BusHandle<DiskRequest>,
    irq: BusHandle<Irq>,
    next_usertag: u32,

    features_error: u8,
    sector_count: u8,
    lba_low: u8,
    lba_mid: u8,
    lba_high: u8,
    drive_head: u8,
    status: u8,
    irq_disabled: bool,

    data_buffer: [u16; SECTOR_WORDS],
    data_index: usize,
    data_ready: bool,
    pending_write_lba: Option<u64>,
}

impl IdeChannel {
    pub fn new(disk_request: BusHandle<DiskRequest>, irq: BusHandle<Irq>) -> Self {
        IdeChannel {
            disk_request,
            irq,
            next_usertag: 1,
            features_error: 0,
            sector_count: 0,
            lba_low: 0,
            lba_mid: 0,
            lba_high: 0,
            drive_head: 0xa0,
            status: STATUS_DRDY,
            irq_disabled: false,
            data_buffer: [0; SECTOR_WORDS],
            data_index: 0,
            data_ready: false,
            pending_write_lba: None,
        }
    }

    fn lba(&self) -> u64 {
        (self.lba_low as u64) | (self.lba_mid as u64) << 8 | (self.lba_high as u64) << 16 | ((self.drive_head & 0x0f) as u64) << 24
    }

    fn raise_irq14(&mut self) {
        if !self.irq_disabled {
            let mut assert = Irq::Assert(14);
            self.irq.send(&mut assert);
        }
    }

    fn take_usertag(&mut self) -> u32 {
        let tag = self.next_usertag;
        self.next_usertag = self.next_usertag.wrapping_add(1).max(1);
        tag
    }

    fn issue(&mut self, op: DiskOp) {
        self.status = STATUS_BSY;
        let usertag = self.take_usertag();
        let mut req = DiskRequest { disk: 0, op, sector: self.lba(), dma_index: 0, usertag };
        self.disk_request.send(&mut req);
    }

    fn complete(&mut self, ok: bool) {
        if ok {
            self.status = STATUS_DRDY | STATUS_DRQ;
            self.data_ready = true;
            self.data_index = 0;
        } else {
            self.status = STATUS_DRDY | STATUS_ERR;
            self.features_error = 0x04; // ABRT
        }
        self.raise_irq14();
    }

    fn write_command(&mut self, command: u8) {
        match command {
            CMD_READ_SECTORS => self.issue(DiskOp::Read),
            CMD_WRITE_SECTORS => {
                self.pending_write_lba = Some(self.lba());
                self.status = STATUS_DRDY | STATUS_DRQ;
                self.data_ready = true;
                self.data_index = 0;
            }
            CMD_IDENTIFY => {
                self.data_buffer = [0; SECTOR_WORDS];
                self.data_buffer[0] = 0x0040; // ATA device, non-removable
                self.status = STATUS_DRDY | STATUS_DRQ;
                self.data_ready = true;
                self.data_index = 0;
                self.raise_irq14();
            }
            _ => {
                self.status = STATUS_DRDY | STATUS_ERR;
                self.features_error = 0x04;
            }
        }
    }

    fn read_data_word(&mut self) -> u16 {
        if !self.data_ready {
            return 0;
        }
        let word = self.data_buffer[self.data_index];
        self.data_index += 1;
        if self.data_index >= SECTOR_WORDS {
            self.data_ready = false;
            self.status &= !STATUS_DRQ;
        }
        word
    }

    fn write_data_word(&mut self, word: u16) {
        if self.data_index < SECTOR_WORDS {
            self.data_buffer[self.data_index] = word;
            self.data_index += 1;
        }
        if self.data_index >= SECTOR_WORDS {
            self.data_ready = false;
            self.status &= !STATUS_DRQ;
            if let Some(_lba) = self.pending_write_lba.take() {
                self.issue(DiskOp::Write);
            }
        }
    }
}

impl msgbus::BusDevice<PortIo> for IdeChannel {
    fn handle(&mut self, msg: &mut PortIo) -> bool {
        match msg.port {
            0x1f0 => {
                if msg.write {
                    let word = u16::from_le_bytes([msg.data[0], msg.data.get(1).copied().unwrap_or(0)]);
                    self.write_data_word(word);
                } else {
                    let word = self.read_data_word();
                    msg.data[0] = word as u8;
                    msg.data[1] = (word >> 8) as u8;
                    msg.len = 2;
                }
                true
            }
            0x1f1 => {
                if !msg.write {
                    msg.data[0] = self.features_error;
                    msg.len = 1;
                }
                true
            }
            0x1f2 => {
                if msg.write {
                    self.sector_count = msg.data[0];
                } else {
                    msg.data[0] = self.sector_count;
                    msg.len = 1;
                }
                true
            }
            0x1f3 => {
                if msg.write {
                    self.lba_low = msg.data[0];
                } else {
                    msg.data[0] = self.lba_low;
                    msg.len = 1;
                }
                true
            }
            0x1f4 => {
                if msg.write {
                    self.lba_mid = msg.data[0];
                } else {
                    msg.data[0] = self.lba_mid;
                    msg.len = 1;
                }
                true
            }
            0x1f5 => {
                if msg.write {
                    self.lba_high = msg.data[0];
                } else {
                    msg.data[0] = self.lba_high;
                    msg.len = 1;
                }
                true
            }
            0x1f6 => {
                if msg.write {
                    self.drive_head = msg.data[0];
                } else {
                    msg.data[0] = self.drive_head;
                    msg.len = 1;
                }
                true
            }
            0x1f7 => {
                if msg.write {
                    self.write_command(msg.data[0]);
                } else {
                    msg.data[0] = self.status;
                    msg.len = 1;
                }
                true
            }
            0x3f6 => {
                if msg.write {
                    self.irq_disabled = msg.data[0] & 0x02 != 0;
                } else {
                    msg.data[0] = self.status;
                    msg.len = 1;
                }
                true
            }
            _ => false,
        }
    }
}

impl msgbus::BusDevice<DiskCommit> for IdeChannel {
    fn handle(&mut self, msg: &mut DiskCommit) -> bool {
        self.complete(msg.status == DiskStatus::Ok);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgbus::{Bus, DispatchOrder};

    fn new_channel() -> IdeChannel {
        IdeChannel::new(Bus::new(DispatchOrder::Fifo), Bus::new(DispatchOrder::Fifo))
    }

    fn write_reg(ide: &mut IdeChannel, port: u16, value: u8) {
        let mut msg = PortIo { port, write: true, data: [value, 0, 0, 0], len: 1 };
        ide.handle(&mut msg);
    }

    #[test]
    fn identify_populates_data_buffer_and_raises_irq14() {
        let mut ide = new_channel();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            ide.irq.register(
                msgbus::DeviceId(0),
                std::sync::Arc::new(std::sync::Mutex::new(move |msg: &mut Irq| {
                    seen.lock().unwrap().push(*msg);
                    true
                })),
            );
        }
        write_reg(&mut ide, 0x1f7, CMD_IDENTIFY);
        assert!(ide.data_ready);
        assert!(matches!(seen.lock().unwrap()[0], Irq::Assert(14)));
    }

    #[test]
    fn read_sectors_issues_disk_request_with_selected_lba() {
        let mut ide = new_channel();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::<DiskRequest>::new()));
        {
            let seen = seen.clone();
            ide.disk_request.register(
                msgbus::DeviceId(0),
                std::sync::Arc::new(std::sync::Mutex::new(move |msg: &mut DiskRequest| {
                    seen.lock().unwrap().push(DiskRequest { disk: msg.disk, op: msg.op, sector: msg.sector, dma_index: msg.dma_index, usertag: msg.usertag });
                    true
                })),
            );
        }
        write_reg(&mut ide, 0x1f3, 0x10);
        write_reg(&mut ide, 0x1f7, CMD_READ_SECTORS);
        let reqs = seen.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].sector, 0x10);
        assert_eq!(reqs[0].op, DiskOp::Read);
    }

    #[test]
    fn disk_commit_clears_busy_and_sets_drq_on_success() {
        let mut ide = new_channel();
        write_reg(&mut ide, 0x1f7, CMD_READ_SECTORS);
        let mut commit = DiskCommit { usertag: 1, status: DiskStatus::Ok };
        msgbus::BusDevice::<DiskCommit>::handle(&mut ide, &mut commit);
        assert_eq!(ide.status & STATUS_DRQ, STATUS_DRQ);
        assert_eq!(ide.status & STATUS_ERR, 0);
    }

    #[test]
    fn disk_commit_failure_sets_error_status() {
        let mut ide = new_channel();
        write_reg(&mut ide, 0x1f7, CMD_READ_SECTORS);
        let mut commit = DiskCommit { usertag: 1, status: DiskStatus::Device };
        msgbus::BusDevice::<DiskCommit>::handle(&mut ide, &mut commit);
        assert_eq!(ide.status & STATUS_ERR, STATUS_ERR);
    }
}
