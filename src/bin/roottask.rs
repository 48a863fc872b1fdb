//! The privileged root task: allocates capabilities and regions, builds the
//! boot module table from a Nulconfig file, and drives the parent protocol
//! dispatcher through every module's own startup tokens (REGISTER for a
//! module that names a `namespace::`, OPEN for one that names a `name::`).
//!
//! There is no real capability kernel underneath this host-side exercise,
//! so capability resolution is backed by `kernel_iface::MockKernel`
//! (documented in DESIGN.md) rather than a syscall layer — every other
//! piece (`captable`, `regionmap`, `registry`, `parent`, `nulcfg`) runs
//! exactly as it would against a real one.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use kernel_iface::{CountingSemaphore, MockKernel, Semaphore};
use nulcfg::{nulconfig, Cmdline};
use parent::Parent;
use regionmap::RegionMap;

#[derive(Parser)]
#[clap(version = "0.1", author = "vmm-stack root task")]
struct RootTaskOpts {
    /// Path to a Nulconfig boot-configuration file.
    #[clap(long)]
    nulconfig: String,

    /// Memory budget (bytes) the quota ledger starts with.
    #[clap(long, default_value = "67108864")]
    mem_budget: i64,

    /// Capability budget the quota ledger starts with.
    #[clap(long, default_value = "65536")]
    cap_budget: i64,

    /// Print the running quota ledger totals after processing every module.
    #[clap(long)]
    dump_quotas: bool,

    /// A level of verbosity, can be used multiple times.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("failed to read nulconfig file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse nulconfig file: {0}")]
    Nulconfig(#[from] nulconfig::NulconfigError),
}

fn main() -> Result<(), Error> {
    let opts = RootTaskOpts::parse();
    let level = match opts.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let contents = fs::read_to_string(&opts.nulconfig)?;
    let modules = nulconfig::parse(&contents)?;
    log::info!("loaded {} module(s) from {}", modules.len(), opts.nulconfig);

    // Physical, guest-virtual, and host-virtual region books (spec.md
    // §4.2): three independent `RegionMap` instances sharing one type.
    let mut free_phys = RegionMap::new();
    let mut virt_phys = RegionMap::new();
    let mut free_virt = RegionMap::new();
    free_phys.add(regionmap::Region { virt_start: 0, length: 1 << 32, phys_start: 0 });
    free_virt.add(regionmap::Region { virt_start: 0, length: 1 << 32, phys_start: 0 });
    let _ = &mut virt_phys; // populated as modules are mapped in; none in this demo walk.

    let kernel = Arc::new(MockKernel::new());
    let parent = Parent::new(kernel.clone(), 0x1000, 20, opts.mem_budget, opts.cap_budget);

    let mut last_session = None;
    for (index, module) in modules.iter().enumerate() {
        let pseudonym = index as u32;
        let full_cmdline = format!("{} {}", module.sigma0_args, module.client_cmdline());
        let cmd = Cmdline::new(&full_cmdline);

        if let Some(namespace) = cmd.namespace() {
            let portal = 0x8000 + pseudonym;
            let cpu = cmd.cpu_pin().unwrap_or(0);
            match parent.register(&full_cmdline, cpu, &module.path, portal) {
                Ok(identity) => {
                    kernel.birth(identity);
                    kernel.birth(portal);
                    log::info!("module {pseudonym} ({}) registered under {namespace} as identity {identity}", module.path);
                }
                Err(e) => log::warn!("module {pseudonym} ({}) failed to register: {e}", module.path),
            }
        }

        if cmd.get("name::").is_some() {
            let wake: Arc<dyn Semaphore> = Arc::new(CountingSemaphore::new());
            match parent.open(pseudonym, &full_cmdline, 0, 0, &module.path, wake) {
                Ok(session) => {
                    log::info!("module {pseudonym} opened a session ({session}) against {}", module.path);
                    last_session = Some(session);
                }
                Err(e) => log::warn!("module {pseudonym} denied OPEN against {}: {e}", module.path),
            }
        }
    }

    if opts.dump_quotas {
        if let Some(session) = last_session {
            let mem = parent.get_quota(session, "", "mem", 0);
            let caps = parent.get_quota(session, "", "cap", 0);
            log::info!("quota ledger: mem={mem:?} caps={caps:?}");
        } else {
            log::info!("quota ledger: no session available to query (no module requested one)");
        }
    }

    Ok(())
}
