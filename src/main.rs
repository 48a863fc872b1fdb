use clap::Parser;
use vmm::{VmmConfig, VMM};

#[derive(Parser)]
#[clap(version = "0.1", author = "vmm-stack")]
struct VMMOpts {
    /// Flat real-mode module image booted at reset
    #[clap(short, long)]
    module: String,

    /// Command line handed to the module (becomes the MBI cmdline)
    #[clap(long, default_value = "")]
    cmdline: String,

    /// Number of virtual CPUs assigned to the guest
    #[clap(short, long, default_value = "1")]
    cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    #[clap(short, long, default_value = "128")]
    memory: u32,

    /// A level of verbosity, and can be used multiple times
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Stdout console file path
    #[clap(long)]
    console: Option<String>,

    /// Interface name
    #[clap(long)]
    net: Option<String>,
}

#[derive(Debug)]
pub enum Error {
    VmmNew(vmm::Error),
    VmmConfig(vmm::config::Error),
    VmmConfigure(vmm::Error),
    VmmRun(vmm::Error),
}

fn main() -> Result<(), Error> {
    let opts: VMMOpts = VMMOpts::parse();
    let level = match opts.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let mut cfg = VmmConfig::new(opts.module, opts.cmdline).map_err(Error::VmmConfig)?;
    cfg.cpus = opts.cpus;
    cfg.memory = opts.memory;
    cfg.console = opts.console;
    cfg.tap = opts.net.map(|tap_name| vmm::config::NetConfig { tap_name });

    let mut vmm = VMM::new().map_err(Error::VmmNew)?;
    vmm.configure(&cfg).map_err(Error::VmmConfigure)?;
    vmm.run().map_err(Error::VmmRun)?;

    Ok(())
}
