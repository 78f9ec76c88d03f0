//! talon command line front-end.

use std::fs;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use clap::Parser;

use talon_core::config::{default_config, load_config, RunMode, RuntimeConfig};
use talon_core::detect::DetectEngine;
use talon_core::runtime::Runtime;

#[derive(Parser, Debug)]
#[clap(name = "talon", about = "network intrusion detection engine", version)]
struct Args {
    /// Configuration file.
    #[clap(short = 'c', value_name = "FILE")]
    config: Option<String>,

    /// Signature file.
    #[clap(short = 's', value_name = "FILE")]
    signatures: Option<String>,

    /// Log directory, overrides the configured default-log-dir.
    #[clap(short = 'l', value_name = "DIR")]
    log_dir: Option<String>,

    /// Sniff a live interface with pcap.
    #[clap(long = "pcap", value_name = "IFACE")]
    pcap: Option<String>,

    /// Read packets from a capture file.
    #[clap(long = "pcap-file", value_name = "FILE")]
    pcap_file: Option<String>,

    /// Sniff a live interface with AF_PACKET.
    #[clap(long = "af-packet", value_name = "IFACE")]
    af_packet: Option<String>,

    /// Accept packets from NFQUEUE (requires an inline source plug-in).
    #[clap(long = "nfq")]
    nfq: bool,

    /// Runmode: auto, autofp, or workers.
    #[clap(long = "runmode", value_name = "NAME")]
    runmode: Option<String>,

    /// Treat rule parse errors as fatal.
    #[clap(long = "init-errors-fatal")]
    init_errors_fatal: bool,
}

fn apply_args(cfg: &mut RuntimeConfig, args: &Args) -> Result<()> {
    if args.nfq {
        bail!("the NFQUEUE source is provided by an external plug-in, not this build");
    }
    if let Some(path) = &args.pcap_file {
        cfg.source.pcap_file = Some(path.clone());
        cfg.source.interface = None;
    }
    // AF_PACKET capture is serviced through the pcap live source.
    if let Some(iface) = args.pcap.as_ref().or(args.af_packet.as_ref()) {
        cfg.source.interface = Some(iface.clone());
        cfg.source.pcap_file = None;
    }
    if let Some(dir) = &args.log_dir {
        cfg.outputs.default_log_dir = dir.clone();
    }
    if let Some(runmode) = &args.runmode {
        cfg.pipeline.runmode = match runmode.as_str() {
            "auto" => RunMode::Auto,
            "autofp" => RunMode::AutoFp,
            "workers" => RunMode::Workers,
            other => bail!("unknown runmode {:?}", other),
        };
    }
    if args.init_errors_fatal {
        cfg.detect.init_errors_fatal = true;
    }
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    apply_args(&mut cfg, &args)?;

    let rules = match &args.signatures {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("reading rule file {}", path))?
        }
        None => String::new(),
    };
    let detect = DetectEngine::from_rules(&rules, &cfg.detect)?;

    let runtime = Runtime::new(cfg, detect)?;
    let kill = runtime.shutdown_handle();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        kill.store(true, Ordering::Release);
    })
    .context("installing signal handler")?;

    runtime.run()
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("talon: {:#}", e);
        std::process::exit(1);
    }
}
