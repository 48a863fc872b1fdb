//! Dual 8259A programmable interrupt controller (spec.md §1, §4.6 step 9
//! "EXTINT — INTA directly from the legacy PIC model").
//!
//! Two cascaded controllers (master at 0x20/0x21, slave at 0xA0/0xA1) share
//! the same ICW/OCW state machine; the slave's output feeds the master's
//! IRQ2 line. The pair claims the legacy `LegacyEvent::Inta` message so the
//! VCPU core's EXTINT path can pull a vector without knowing which
//! controller owns the requested line.

use msgbus::{Irq, LegacyEvent, PortIo};

const CASCADE_LINE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    Idle,
    WantIcw2,
    WantIcw3,
    WantIcw4,
}

/// One 8259A. `irr`/`isr`/`imr` are bitmasks over this controller's 8 input
/// lines (0..=7), matching the real chip's register layout.
struct Pic8259 {
    irr: u8,
    isr: u8,
    imr: u8,
    vector_base: u8,
    auto_eoi: bool,
    read_isr: bool,
    init: InitStep,
    needs_icw4: bool,
    is_slave: bool,
}

impl Pic8259 {
    fn new(is_slave: bool) -> Self {
        Pic8259 {
            irr: 0,
            isr: 0,
            imr: 0xff,
            vector_base: 0,
            auto_eoi: false,
            read_isr: false,
            init: InitStep::Idle,
            needs_icw4: false,
            is_slave,
        }
    }

    fn raise(&mut self, line: u8) {
        self.irr |= 1 << line;
    }

    fn lower(&mut self, line: u8) {
        self.irr &= !(1 << line);
    }

    /// Highest-priority line (lowest index wins) that is pending,
    /// unmasked, and not already in service.
    fn highest_pending(&self) -> Option<u8> {
        let ready = self.irr & !self.imr & !self.isr;
        if ready == 0 {
            None
        } else {
            Some(ready.trailing_zeros() as u8)
        }
    }

    /// INTA cycle: commit the highest-pending line into ISR, clear it from
    /// IRR (level-triggered lines are re-raised by the device model on the
    /// next edge), and return its vector.
    fn inta(&mut self) -> Option<u8> {
        let line = self.highest_pending()?;
        self.isr |= 1 << line;
        self.irr &= !(1 << line);
        Some(self.vector_base + line)
    }

    fn write_cmd(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1: start initialization sequence.
            self.imr = 0;
            self.isr = 0;
            self.irr = 0;
            self.needs_icw4 = value & 0x01 != 0;
            self.init = InitStep::WantIcw2;
            return;
        }
        if value & 0x08 != 0 {
            // OCW3: read register select / poll command.
            self.read_isr = value & 0x03 == 0x03;
            return;
        }
        // OCW2: EOI family.
        let eoi_kind = value >> 5;
        match eoi_kind {
            0b001 => {
                // Non-specific EOI: clear the lowest set ISR bit.
                if self.isr != 0 {
                    let line = self.isr.trailing_zeros();
                    self.isr &= !(1 << line);
                }
            }
            0b011 => {
                // Specific EOI: clear the named line.
                let line = value & 0x07;
                self.isr &= !(1 << line);
            }
            _ => {}
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.init {
            InitStep::WantIcw2 => {
                self.vector_base = value & 0xf8;
                self.init = if self.is_slave {
                    InitStep::WantIcw3
                } else {
                    InitStep::WantIcw3 // master also consumes an ICW3 (cascade map)
                };
            }
            InitStep::WantIcw3 => {
                self.init = if self.needs_icw4 {
                    InitStep::WantIcw4
                } else {
                    InitStep::Idle
                };
            }
            InitStep::WantIcw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.init = InitStep::Idle;
            }
            InitStep::Idle => {
                self.imr = value;
            }
        }
    }

    fn read_data(&self) -> u8 {
        self.imr
    }

    fn read_cmd(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }
}

/// The master/slave pair, as a single message-bus device. Registered on
/// both the `port_io` bus (ICW/OCW programming) and the `legacy_event` bus
/// (INTA cycles); a separate `raise_irq`/`lower_irq` call (not a bus
/// message — this is host-side glue invoked directly by the PIT/PS2/IDE
/// device models that own a GSI) feeds line state.
pub struct Pic8259Pair {
    master: Pic8259,
    slave: Pic8259,
}

impl Pic8259Pair {
    pub fn new() -> Self {
        Pic8259Pair { master: Pic8259::new(false), slave: Pic8259::new(true) }
    }

    /// Raise a legacy GSI (0..=15). Lines 8..=15 belong to the slave and
    /// its output is wired to the master's cascade line.
    pub fn raise_irq(&mut self, gsi: u8) {
        if gsi < 8 {
            self.master.raise(gsi);
        } else {
            self.slave.raise(gsi - 8);
            self.master.raise(CASCADE_LINE);
        }
    }

    pub fn lower_irq(&mut self, gsi: u8) {
        if gsi < 8 {
            self.master.lower(gsi);
        } else {
            self.slave.lower(gsi - 8);
        }
    }

    /// Whether any unmasked, not-yet-in-service line is pending — used by
    /// the VCPU glue to decide whether to raise `EventBits::EXTINT`.
    pub fn has_pending(&self) -> bool {
        self.master.highest_pending().is_some()
    }

    fn inta_cycle(&mut self) -> u8 {
        match self.master.highest_pending() {
            Some(CASCADE_LINE) => {
                self.master.isr |= 1 << CASCADE_LINE;
                self.master.irr &= !(1 << CASCADE_LINE);
                self.slave.inta().unwrap_or(self.slave.vector_base)
            }
            Some(_) => self.master.inta().unwrap(),
            None => self.master.vector_base + 7, // spurious IRQ7
        }
    }
}

impl Default for Pic8259Pair {
    fn default() -> Self {
        Self::new()
    }
}

impl msgbus::BusDevice<PortIo> for Pic8259Pair {
    fn handle(&mut self, msg: &mut PortIo) -> bool {
        let pic = match msg.port {
            0x20 | 0x21 => &mut self.master,
            0xa0 | 0xa1 => &mut self.slave,
            _ => return false,
        };
        let is_cmd_port = msg.port == 0x20 || msg.port == 0xa0;
        if msg.write {
            let value = msg.data[0];
            if is_cmd_port {
                pic.write_cmd(value);
            } else {
                pic.write_data(value);
            }
        } else {
            msg.data[0] = if is_cmd_port { pic.read_cmd() } else { pic.read_data() };
            msg.len = 1;
        }
        true
    }
}

impl msgbus::BusDevice<Irq> for Pic8259Pair {
    fn handle(&mut self, msg: &mut Irq) -> bool {
        match *msg {
            Irq::Assert(gsi) => self.raise_irq(gsi),
            Irq::Deassert(gsi) => self.lower_irq(gsi),
            Irq::Notify(_) => {}
        }
        true
    }
}

impl msgbus::BusDevice<LegacyEvent> for Pic8259Pair {
    fn handle(&mut self, msg: &mut LegacyEvent) -> bool {
        if let LegacyEvent::Inta { vector_out } = msg {
            *vector_out = self.inta_cycle();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_port(pic: &mut Pic8259Pair, port: u16, write: bool, value: u8) -> PortIo {
        let mut msg = PortIo { port, write, data: [value, 0, 0, 0], len: 1 };
        pic.handle(&mut msg);
        msg
    }

    #[test]
    fn icw_sequence_programs_vector_base() {
        let mut pic = Pic8259Pair::new();
        send_port(&mut pic, 0x20, true, 0x11); // ICW1: edge, cascade, ICW4 needed
        send_port(&mut pic, 0x21, true, 0x08); // ICW2: vector base 0x08
        send_port(&mut pic, 0x21, true, 0x04); // ICW3: cascade map
        send_port(&mut pic, 0x21, true, 0x01); // ICW4
        send_port(&mut pic, 0x21, true, 0x00); // OCW1: unmask everything
        pic.raise_irq(0);
        assert_eq!(pic.inta_cycle(), 0x08);
    }

    #[test]
    fn masked_line_does_not_deliver() {
        let mut pic = Pic8259Pair::new();
        init_basic(&mut pic);
        send_port(&mut pic, 0x21, true, 0xff); // mask everything
        pic.raise_irq(1);
        assert!(!pic.has_pending());
    }

    #[test]
    fn lower_priority_line_waits_behind_higher_priority_one() {
        let mut pic = Pic8259Pair::new();
        init_basic(&mut pic);
        pic.raise_irq(3);
        pic.raise_irq(1);
        assert_eq!(pic.inta_cycle(), 0x08 + 1);
        assert_eq!(pic.inta_cycle(), 0x08 + 3);
    }

    #[test]
    fn specific_eoi_clears_named_isr_bit() {
        let mut pic = Pic8259Pair::new();
        init_basic(&mut pic);
        pic.raise_irq(2 + 8); // slave line, goes through cascade
        let vector = pic.inta_cycle();
        assert_eq!(vector, 0x70 + 2);
        send_port(&mut pic, 0xa0, true, 0x62); // specific EOI, line 2 on slave
        assert_eq!(pic.slave.isr, 0);
    }

    fn init_basic(pic: &mut Pic8259Pair) {
        send_port(pic, 0x20, true, 0x11);
        send_port(pic, 0x21, true, 0x08);
        send_port(pic, 0x21, true, 0x04);
        send_port(pic, 0x21, true, 0x01);
        send_port(pic, 0x21, true, 0x00);
        send_port(pic, 0xa0, true, 0x11);
        send_port(pic, 0xa1, true, 0x70);
        send_port(pic, 0xa1, true, 0x02);
        send_port(pic, 0xa1, true, 0x01);
        send_port(pic, 0xa1, true, 0x00);
    }
}
