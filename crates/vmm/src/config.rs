//! Per-VM configuration, the direct generalization of the teacher's
//! `config/mod.rs`: a single Linux `KernelConfig` becomes a flat real-mode
//! module plus the command line it boots with, since this stack has no
//! Linux boot protocol to honor (spec.md §6's Multiboot/Nulconfig model
//! replaces it).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("module file check error: {0}")]
    ModuleConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    pub tap_name: String,
}

/// VMM configuration. `cpus`/`memory`/`console`/`tap` mirror the teacher's
/// `VMMConfig` fields one for one; `module` replaces `kernel`.
#[derive(Debug, Clone)]
pub struct VmmConfig {
    /// Path to the flat real-mode module image booted at reset.
    pub module_path: PathBuf,

    /// Command line handed to the module (becomes the MBI's `cmdline` field
    /// and the module's own `string_ptr` entry, spec.md §6).
    pub module_cmdline: String,

    /// Number of virtual CPUs assigned to the guest.
    pub cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest.
    pub memory: u32,

    /// A level of verbosity, can be used multiple times.
    pub verbose: u8,

    /// Stdout console file path.
    pub console: Option<String>,

    /// Define a TAP interface name used to give the guest network access.
    pub tap: Option<NetConfig>,
}

impl VmmConfig {
    pub fn new(module_path: String, module_cmdline: String) -> Result<Self, Error> {
        let path = PathBuf::from(&module_path);
        if !path.exists() {
            return Err(Error::ModuleConfig(format!("{module_path} does not exist")));
        }
        Ok(VmmConfig {
            module_path: path,
            module_cmdline,
            cpus: 1,
            memory: 128,
            verbose: 0,
            console: None,
            tap: None,
        })
    }
}
