//! PC platform device models (spec.md §1's named peripheral set: PCI host
//! bridge, AHCI, IDE, NE2000, VGA, PIT, PIC, RTC, keyboard/PS2, BIOS
//! extensions, VESA). Each device is a bespoke struct implementing
//! [`msgbus::BusDevice`] for whichever message types it consumes, rather
//! than going through the rust-vmm `vm-device`/`vm-superio` abstractions
//! the teacher crate uses — this repo's own `msgbus` fabric is the
//! dispatch layer (spec.md §9's REDESIGN FLAGS call out generalizing the
//! teacher's IoManager/MmioManager pattern into exactly this).

pub mod ahci;
pub mod bios_ext;
pub mod ide;
pub mod ne2000;
pub mod pci;
pub mod pic;
pub mod pit;
pub mod platform;
pub mod ps2;
pub mod rtc;
pub mod vesa;
pub mod vga;

pub use ahci::AhciHba;
pub use bios_ext::BiosServices;
pub use ide::IdeChannel;
pub use ne2000::Ne2000;
pub use pci::{PciFunction, PciHostBridge};
pub use pic::Pic8259Pair;
pub use pit::Pit8254;
pub use platform::PcPlatform;
pub use ps2::Ps2Controller;
pub use rtc::{Rtc, WallClock};
pub use vesa::VesaController;
pub use vga::VgaAdapter;
