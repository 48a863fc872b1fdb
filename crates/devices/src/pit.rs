//! 8254 programmable interval timer. Channel 0's output line is wired to
//! legacy GSI 0 (spec.md §4.6's `EXTINT` source, and the BIOS disk-wait
//! path's wake edge per spec.md §4.6 "BIOS re-entry trampoline": "re-arming
//! on completion via an edge on legacy IRQ 1" uses the keyboard controller,
//! not the PIT, but both ride the same `Irq` bus).
//!
//! Ports 0x40-0x42 are the three channels' data ports; 0x43 is the shared
//! control-word port. Channels 1/2 (DRAM refresh / PC-speaker gate) are
//! modelled only as far as the counter/mode state machine; no side effect
//! beyond channel 0 is implemented, since nothing in this repo's device set
//! consumes them.

use msgbus::{BusHandle, Irq, PortIo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Latch,
    Lsb,
    Msb,
    LsbThenMsb,
}

struct Channel {
    mode: u8,
    access: AccessMode,
    bcd: bool,
    reload: u16,
    counter: u16,
    latched: Option<u16>,
    write_low_pending: bool,
    read_high_pending: bool,
}

impl Channel {
    fn new() -> Self {
        Channel {
            mode: 0,
            access: AccessMode::LsbThenMsb,
            bcd: false,
            reload: 0,
            counter: 0,
            latched: None,
            write_low_pending: false,
            read_high_pending: false,
        }
    }

    fn set_control(&mut self, control: u8) {
        self.access = match (control >> 4) & 0x3 {
            0 => AccessMode::Latch,
            1 => AccessMode::Lsb,
            2 => AccessMode::Msb,
            _ => AccessMode::LsbThenMsb,
        };
        if self.access == AccessMode::Latch {
            self.latched = Some(self.counter);
            return;
        }
        self.mode = (control >> 1) & 0x7;
        self.bcd = control & 0x1 != 0;
        self.write_low_pending = self.access != AccessMode::Msb;
        self.read_high_pending = false;
    }

    fn write_data(&mut self, value: u8) {
        match self.access {
            AccessMode::Lsb => self.reload = (self.reload & 0xff00) | value as u16,
            AccessMode::Msb => self.reload = (self.reload & 0x00ff) | ((value as u16) << 8),
            AccessMode::LsbThenMsb => {
                if self.write_low_pending {
                    self.reload = (self.reload & 0xff00) | value as u16;
                } else {
                    self.reload = (self.reload & 0x00ff) | ((value as u16) << 8);
                }
                self.write_low_pending = !self.write_low_pending;
            }
            AccessMode::Latch => {}
        }
        let reload_committed = match self.access {
            AccessMode::LsbThenMsb => self.write_low_pending, // just flipped back to true
            _ => true,
        };
        if reload_committed {
            self.counter = self.reload;
        }
    }

    fn read_data(&mut self) -> u8 {
        let value = self.latched.unwrap_or(self.counter);
        let byte = match self.access {
            AccessMode::Msb => (value >> 8) as u8,
            AccessMode::Lsb => value as u8,
            AccessMode::LsbThenMsb | AccessMode::Latch => {
                let out = if self.read_high_pending { (value >> 8) as u8 } else { value as u8 };
                self.read_high_pending = !self.read_high_pending;
                if !self.read_high_pending {
                    self.latched = None;
                }
                out
            }
        };
        byte
    }

    /// Decrement by one tick; returns `true` on the terminal-count edge
    /// that should pulse the channel's output line (modes 2 and 3 reload
    /// and repeat; the rest free-run to zero and stop).
    fn tick(&mut self) -> bool {
        if self.counter == 0 {
            self.counter = self.reload;
        }
        self.counter = self.counter.wrapping_sub(1);
        if self.counter == 0 {
            match self.mode {
                2 | 3 => {
                    self.counter = self.reload;
                    true
                }
                _ => true,
            }
        } else {
            false
        }
    }
}

pub struct Pit8254 {
    channels: [Channel; 3],
    irq: BusHandle<Irq>,
}

impl Pit8254 {
    pub fn new(irq: BusHandle<Irq>) -> Self {
        Pit8254 { channels: [Channel::new(), Channel::new(), Channel::new()], irq }
    }

    /// Advance one PIT clock pulse. The caller (the `vmm` main loop) owns
    /// translating host wall-clock time into ticks at the PIT's ~1.19 MHz
    /// rate; this model only counts pulses.
    pub fn tick(&mut self) {
        if self.channels[0].tick() {
            let mut assert = Irq::Assert(0);
            self.irq.send(&mut assert);
            let mut deassert = Irq::Deassert(0);
            self.irq.send(&mut deassert);
        }
        let _ = self.channels[1].tick();
        let _ = self.channels[2].tick();
    }

    pub fn channel0_count(&self) -> u16 {
        self.channels[0].counter
    }
}

impl msgbus::BusDevice<PortIo> for Pit8254 {
    fn handle(&mut self, msg: &mut PortIo) -> bool {
        match msg.port {
            0x40..=0x42 => {
                let channel = &mut self.channels[(msg.port - 0x40) as usize];
                if msg.write {
                    channel.write_data(msg.data[0]);
                } else {
                    msg.data[0] = channel.read_data();
                    msg.len = 1;
                }
                true
            }
            0x43 => {
                if msg.write {
                    let control = msg.data[0];
                    let channel_idx = (control >> 6) & 0x3;
                    if channel_idx < 3 {
                        self.channels[channel_idx as usize].set_control(control);
                    }
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

    fn new_pit() -> Pit8254 {
        Pit8254::new(Bus::new(DispatchOrder::Fifo))
    }

    #[test]
    fn programming_channel0_mode2_and_reading_back_lsb_msb() {
        let mut pit = new_pit();
        let mut ctrl = PortIo { port: 0x43, write: true, data: [0x34, 0, 0, 0], len: 1 }; // ch0, lobyte/hibyte, mode2
        pit.handle(&mut ctrl);
        let mut lo = PortIo { port: 0x40, write: true, data: [0x00, 0, 0, 0], len: 1 };
        pit.handle(&mut lo);
        let mut hi = PortIo { port: 0x40, write: true, data: [0x04, 0, 0, 0], len: 1 }; // reload 0x0400
        pit.handle(&mut hi);
        assert_eq!(pit.channel0_count(), 0x0400);
    }

    #[test]
    fn terminal_count_pulses_irq0() {
        let mut pit = new_pit();
        let mut ctrl = PortIo { port: 0x43, write: true, data: [0x34, 0, 0, 0], len: 1 };
        pit.handle(&mut ctrl);
        let mut lo = PortIo { port: 0x40, write: true, data: [0x02, 0, 0, 0], len: 1 };
        pit.handle(&mut lo);
        let mut hi = PortIo { port: 0x40, write: true, data: [0x00, 0, 0, 0], len: 1 }; // reload 2
        pit.handle(&mut hi);

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            pit.irq.register(
                msgbus::DeviceId(0),
                std::sync::Arc::new(std::sync::Mutex::new(move |msg: &mut Irq| {
                    seen.lock().unwrap().push(*msg);
                    true
                })),
            );
        }
        pit.tick(); // counter 2 -> 1
        pit.tick(); // counter 1 -> 0, pulse
        assert!(matches!(seen.lock().unwrap()[0], Irq::Assert(0)));
        assert!(matches!(seen.lock().unwrap()[1], Irq::Deassert(0)));
    }

    #[test]
    fn latch_command_freezes_the_readback_value_across_ticks() {
        let mut pit = new_pit();
        let mut ctrl = PortIo { port: 0x43, write: true, data: [0x34, 0, 0, 0], len: 1 };
        pit.handle(&mut ctrl);
        let mut lo = PortIo { port: 0x40, write: true, data: [0x10, 0, 0, 0], len: 1 };
        pit.handle(&mut lo);
        let mut hi = PortIo { port: 0x40, write: true, data: [0x00, 0, 0, 0], len: 1 };
        pit.handle(&mut hi);

        let mut latch = PortIo { port: 0x43, write: true, data: [0x00, 0, 0, 0], len: 1 };
        pit.handle(&mut latch);
        pit.tick();
        let mut read_lo = PortIo { port: 0x40, write: false, data: [0, 0, 0, 0], len: 0 };
        pit.handle(&mut read_lo);
        assert_eq!(read_lo.data[0], 0x10);
    }
}
