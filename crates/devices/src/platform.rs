//! Wires every device model in this crate onto a [`msgbus::Motherboard`],
//! the way `crates/vmm` assembles a guest's PC platform. Kept as a single
//! aggregator so `vmm` only needs one call per VM instance rather than
//! hand-registering eleven devices across nine buses.

use std::sync::{Arc, Mutex};

use msgbus::{DeviceId, Motherboard};

use crate::ahci::AhciHba;
use crate::bios_ext::BiosServices;
use crate::ide::IdeChannel;
use crate::ne2000::Ne2000;
use crate::pci::PciHostBridge;
use crate::pic::Pic8259Pair;
use crate::pit::Pit8254;
use crate::ps2::Ps2Controller;
use crate::rtc::Rtc;
use crate::vesa::VesaController;
use crate::vga::VgaAdapter;

const IRQ_NE2000: u8 = 9;

pub struct PcPlatform {
    pub pic: Arc<Mutex<Pic8259Pair>>,
    pub pit: Arc<Mutex<Pit8254>>,
    pub rtc: Arc<Mutex<Rtc>>,
    pub ps2: Arc<Mutex<Ps2Controller>>,
    pub pci: Arc<Mutex<PciHostBridge>>,
    pub ide: Arc<Mutex<IdeChannel>>,
    pub ahci: Arc<Mutex<AhciHba>>,
    pub ne2000: Arc<Mutex<Ne2000>>,
    pub vga: Arc<Mutex<VgaAdapter>>,
    pub vesa: Arc<Mutex<VesaController>>,
    pub bios: Arc<Mutex<BiosServices>>,
}

impl PcPlatform {
    pub fn new(mb: &Arc<Motherboard>) -> Self {
        let pic = Arc::new(Mutex::new(Pic8259Pair::new()));
        mb.port_io.register(DeviceId(1), pic.clone());
        mb.irq.register(DeviceId(1), pic.clone());
        mb.legacy_event.register(DeviceId(1), pic.clone());

        let pit = Arc::new(Mutex::new(Pit8254::new(mb.irq.clone())));
        mb.port_io.register(DeviceId(2), pit.clone());

        let rtc = Arc::new(Mutex::new(Rtc::new()));
        mb.port_io.register(DeviceId(3), rtc.clone());
        mb.discovery.register(DeviceId(3), rtc.clone());

        let ps2 = Arc::new(Mutex::new(Ps2Controller::new(mb.irq.clone())));
        mb.port_io.register(DeviceId(4), ps2.clone());
        mb.console.register(DeviceId(4), ps2.clone());

        let pci = Arc::new(Mutex::new(PciHostBridge::new()));
        mb.port_io.register(DeviceId(5), pci.clone());
        mb.pci_config.register(DeviceId(5), pci.clone());
        mb.discovery.register(DeviceId(5), pci.clone());

        let ide = Arc::new(Mutex::new(IdeChannel::new(mb.disk_request.clone(), mb.irq.clone())));
        mb.port_io.register(DeviceId(6), ide.clone());
        mb.disk_commit.register(DeviceId(6), ide.clone());

        let ahci = Arc::new(Mutex::new(AhciHba::new(mb.disk_request.clone())));
        mb.mmio.register(DeviceId(7), ahci.clone());
        mb.disk_commit.register(DeviceId(7), ahci.clone());

        let ne2000 = Arc::new(Mutex::new(Ne2000::new(mb.irq.clone(), IRQ_NE2000)));
        mb.port_io.register(DeviceId(8), ne2000.clone());

        let vga = Arc::new(Mutex::new(VgaAdapter::new()));
        mb.port_io.register(DeviceId(9), vga.clone());
        mb.mmio.register(DeviceId(9), vga.clone());

        let vesa = Arc::new(Mutex::new(VesaController::new()));
        mb.port_io.register(DeviceId(10), vesa.clone());

        let bios = Arc::new(Mutex::new(BiosServices::new(vga.clone(), ps2.clone(), rtc.clone(), 640, 0x0021)));
        mb.bios.register(DeviceId(11), bios.clone());

        PcPlatform { pic, pit, rtc, ps2, pci, ide, ahci, ne2000, vga, vesa, bios }
    }

    /// Advance the PIT by one pulse; the PIC pair sees the resulting
    /// `Irq::Assert`/`Deassert` through its own bus registration, so this
    /// is the only per-tick call `vmm`'s main loop needs to drive.
    pub fn tick_pit(&self) {
        self.pit.lock().unwrap().tick();
    }
}
