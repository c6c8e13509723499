//! `sockexecd`: execution server listening on `<root>/<name>.sock`

use anyhow::{anyhow, Result};
use clap::Parser;
use sockexec::config::{pick, Config};
use sockexec::env::{env_map_to_list, resolve_overlay};
use sockexec::error::EXIT_USAGE;
use sockexec::logging;
use sockexec::server::{Daemon, DaemonOptions};
use sockexec::signal::SignalHandler;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sockexecd", version, about = "Sockexec execution server")]
struct Args {
    /// Socket root directory, created if missing (else config common.root).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Server name; listens on <root>/<name>.sock (else config common.name).
    #[arg(long)]
    name: Option<String>,

    /// Change to this directory at startup (else config server.startdir).
    #[arg(long)]
    startdir: Option<PathBuf>,

    /// Base environment for every command, KEY=VALUE or KEY. Repeatable.
    #[arg(long = "env", value_name = "KEY[=VALUE]")]
    env: Vec<String>,

    /// JSON config file (default ./config.json or $SOCKEXEC_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" (else RUST_LOG, else info).
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = logging::init(args.log_level.as_deref()) {
        eprintln!("sockexecd: {:#}", e);
        process::exit(EXIT_USAGE);
    }
    process::exit(run(args));
}

/// Exit code: 2 for bad options, 1 when the socket cannot be served
fn run(args: Args) -> i32 {
    let options = match build_options(args) {
        Ok(options) => options,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_USAGE;
        }
    };

    let daemon = match Daemon::bind(&options) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
    };

    let mut signals = SignalHandler::with_flag(daemon.shutdown_flag());
    if let Err(e) = signals.setup_with(|sig| warn!(signal = sig, "server signal received")) {
        error!("{:#}", e);
        return 1;
    }

    if let Err(e) = daemon.run() {
        error!("{:#}", e);
        return 1;
    }
    info!(signal = signals.signal_number(), "server stopped");
    0
}

fn build_options(args: Args) -> Result<DaemonOptions> {
    let config = Config::discover(args.config.as_deref())?;

    let root = pick(args.root.map(|p| p.display().to_string()), &config.common.root);
    let name = pick(args.name, &config.common.name);
    let (Some(root), Some(name)) = (root, name) else {
        return Err(anyhow!(
            "usage: sockexecd --root <path> --name <name> [--startdir DIR] [--env ...] [--config PATH]"
        ));
    };

    let mut base_env = env_map_to_list(&config.server.env);
    base_env.extend(resolve_overlay(&args.env, "server")?);

    let start_dir = pick(args.startdir.map(|p| p.display().to_string()), &config.server.startdir).map(PathBuf::from);

    Ok(DaemonOptions {
        root: PathBuf::from(root),
        name,
        start_dir,
        base_env,
    })
}
