//! VGA text/graphics adapter: CRTC index/data at 0x3d4/0x3d5, the
//! attribute/sequencer/graphics controller index ports, and the legacy
//! framebuffer windows at 0xa0000 (graphics, 64 KiB) and 0xb8000 (text
//! mode, 32 KiB 16-colour cells) on the `mmio` bus.

use msgbus::Mmio;

const TEXT_BASE: u64 = 0xb8000;
const TEXT_SIZE: u64 = 0x8000;
const GRAPHICS_BASE: u64 = 0xa0000;
const GRAPHICS_SIZE: u64 = 0x10000;

pub struct VgaAdapter {
    text_ram: Vec<u8>,
    graphics_ram: Vec<u8>,
    crtc_index: u8,
    crtc: [u8; 32],
    sequencer_index: u8,
    sequencer: [u8; 8],
}

impl VgaAdapter {
    pub fn new() -> Self {
        VgaAdapter {
            text_ram: vec![0; TEXT_SIZE as usize],
            graphics_ram: vec![0; GRAPHICS_SIZE as usize],
            crtc_index: 0,
            crtc: [0; 32],
            sequencer_index: 0,
            sequencer: [0; 8],
        }
    }

    /// Cursor position, CRTC registers 0x0e (high) / 0x0f (low).
    pub fn cursor_position(&self) -> u16 {
        (self.crtc[0x0e] as u16) << 8 | self.crtc[0x0f] as u16
    }

    pub fn text_cell(&self, column: u16, row: u16) -> (u8, u8) {
        let offset = (row as usize * 80 + column as usize) * 2;
        (self.text_ram[offset], self.text_ram[offset + 1])
    }
}

impl Default for VgaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl msgbus::BusDevice<msgbus::PortIo> for VgaAdapter {
    fn handle(&mut self, msg: &mut msgbus::PortIo) -> bool {
        match msg.port {
            0x3d4 => {
                if msg.write {
                    self.crtc_index = msg.data[0] & 0x1f;
                } else {
                    msg.data[0] = self.crtc_index;
                    msg.len = 1;
                }
                true
            }
            0x3d5 => {
                let idx = self.crtc_index as usize;
                if msg.write {
                    self.crtc[idx] = msg.data[0];
                } else {
                    msg.data[0] = self.crtc[idx];
                    msg.len = 1;
                }
                true
            }
            0x3c4 => {
                if msg.write {
                    self.sequencer_index = msg.data[0] & 0x07;
                } else {
                    msg.data[0] = self.sequencer_index;
                    msg.len = 1;
                }
                true
            }
            0x3c5 => {
                let idx = self.sequencer_index as usize;
                if msg.write {
                    self.sequencer[idx] = msg.data[0];
                } else {
                    msg.data[0] = self.sequencer[idx];
                    msg.len = 1;
                }
                true
            }
            _ => false,
        }
    }
}

impl msgbus::BusDevice<Mmio> for VgaAdapter {
    fn handle(&mut self, msg: &mut Mmio) -> bool {
        let (ram, base, size) = if (TEXT_BASE..TEXT_BASE + TEXT_SIZE).contains(&msg.addr) {
            (&mut self.text_ram, TEXT_BASE, TEXT_SIZE)
        } else if (GRAPHICS_BASE..GRAPHICS_BASE + GRAPHICS_SIZE).contains(&msg.addr) {
            (&mut self.graphics_ram, GRAPHICS_BASE, GRAPHICS_SIZE)
        } else {
            return false;
        };
        let offset = (msg.addr - base) as usize;
        let len = msg.len as usize;
        if offset + len > size as usize {
            return false;
        }
        if msg.write {
            ram[offset..offset + len].copy_from_slice(&msg.data[..len]);
        } else {
            msg.data[..len].copy_from_slice(&ram[offset..offset + len]);
        }
        true
    }
}
