//! i8042 keyboard controller: data port 0x60, status/command port 0x64.
//! Feeds scancodes from the `Console::Key` bus into an output buffer the
//! guest drains by reading 0x60, and raises legacy GSI 1 on each byte per
//! the usual PC wiring (also the edge the BIOS disk-wait trampoline arms
//! on, per spec.md §4.6).

use msgbus::{BusHandle, Console, Irq, PortIo};
use std::collections::VecDeque;

const STATUS_OUTPUT_FULL: u8 = 0x01;
const STATUS_SYSTEM_FLAG: u8 = 0x04;

pub struct Ps2Controller {
    output: VecDeque<u8>,
    command_byte: u8,
    pending_command: Option<u8>,
    irq: BusHandle<Irq>,
}

impl Ps2Controller {
    pub fn new(irq: BusHandle<Irq>) -> Self {
        Ps2Controller {
            output: VecDeque::new(),
            command_byte: 0x01, // IRQ1 enabled by default
            pending_command: None,
            irq,
        }
    }

    fn status(&self) -> u8 {
        let mut status = STATUS_SYSTEM_FLAG;
        if !self.output.is_empty() {
            status |= STATUS_OUTPUT_FULL;
        }
        status
    }

    fn push_scancode(&mut self, code: u8) {
        self.output.push_back(code);
        if self.command_byte & 0x01 != 0 {
            let mut assert = Irq::Assert(1);
            self.irq.send(&mut assert);
        }
    }

    fn read_data(&mut self) -> u8 {
        self.output.pop_front().unwrap_or(0)
    }

    fn write_data(&mut self, value: u8) {
        match self.pending_command.take() {
            Some(0x60) => self.command_byte = value,
            _ => {
                // Device command (reset, set LEDs, ...) — acknowledge with
                // 0xFA (ACK) so guests that probe the keyboard don't stall.
                self.output.push_back(0xfa);
            }
        }
    }

    fn write_command(&mut self, value: u8) {
        match value {
            0x20 => self.output.push_back(self.command_byte),
            0x60 => self.pending_command = Some(0x60),
            0xad | 0xae => {} // disable/enable first PS/2 port, no-op here
            0xfe => {}        // pulse output line (reset), no-op here
            _ => {}
        }
    }
}

impl msgbus::BusDevice<PortIo> for Ps2Controller {
    fn handle(&mut self, msg: &mut PortIo) -> bool {
        match msg.port {
            0x60 => {
                if msg.write {
                    self.write_data(msg.data[0]);
                } else {
                    msg.data[0] = self.read_data();
                    msg.len = 1;
                }
                true
            }
            0x64 => {
                if msg.write {
                    self.write_command(msg.data[0]);
                } else {
                    msg.data[0] = self.status();
                    msg.len = 1;
                }
                true
            }
            _ => false,
        }
    }
}

impl msgbus::BusDevice<Console> for Ps2Controller {
    fn handle(&mut self, msg: &mut Console) -> bool {
        if let Console::Key(scancode) = msg {
            self.push_scancode(*scancode);
            true
        } else {
            false
        }
    }
}
