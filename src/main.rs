//! `sockexec`: run one command on a sockexec server
//!
//! Exits with the remote command's return code, 1 when the server could not
//! be reached, 2 for local usage or setup errors.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use sockexec::client::{run_call, CallOptions, StdinSource};
use sockexec::config::{pick, Config};
use sockexec::env::{env_map_to_list, resolve_overlay};
use sockexec::error::EXIT_USAGE;
use sockexec::identity::{load_machine_id, sanitize_machine_id};
use sockexec::logging;
use std::io;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sockexec", version, about = "Run a command on a sockexec server")]
struct Args {
    /// Socket root directory (else config common.root).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Server name; connects to <root>/<name>.sock (else config common.name).
    #[arg(long)]
    name: Option<String>,

    /// Working directory for the command on the server.
    #[arg(long, default_value = "")]
    startdir: String,

    /// Literal data fed to the command's stdin.
    #[arg(long, conflicts_with = "stdinfile")]
    stdin: Option<String>,

    /// File fed to the command's stdin.
    #[arg(long)]
    stdinfile: Option<PathBuf>,

    /// Environment overlay, KEY=VALUE or KEY (copied from this environment). Repeatable.
    #[arg(long = "env", value_name = "KEY[=VALUE]")]
    env: Vec<String>,

    /// Machine id override (else config client.id, else /etc/machine-id).
    #[arg(long)]
    id: Option<String>,

    /// Log a timing summary after the call.
    #[arg(long)]
    summary: bool,

    /// JSON config file (default ./config.json or $SOCKEXEC_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" (else RUST_LOG, else info).
    #[arg(long)]
    log_level: Option<String>,

    /// Command and arguments; none pings the server.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() {
    let args = Args::parse();
    process::exit(run(args));
}

fn run(args: Args) -> i32 {
    if let Err(e) = logging::init(args.log_level.as_deref()) {
        eprintln!("sockexec: {:#}", e);
        return EXIT_USAGE;
    }

    let (options, summary) = match build_options(args) {
        Ok(built) => built,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_USAGE;
        }
    };

    match run_call(&options, io::stdout(), io::stderr()) {
        Ok(outcome) => {
            if outcome.reply.is_setup_failure() {
                eprintln!("{}", outcome.reply.error);
            }
            if summary {
                info!("{}", outcome.summary());
            }
            outcome.return_code()
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

fn build_options(args: Args) -> Result<(CallOptions, bool)> {
    let config = Config::discover(args.config.as_deref())?;

    let root = pick(args.root.map(|p| p.display().to_string()), &config.common.root);
    let name = pick(args.name, &config.common.name);
    let (Some(root), Some(name)) = (root, name) else {
        bail!(
            "usage: sockexec --root <path> --name <name> [--startdir DIR] [--stdin STR|--stdinfile PATH] \
             [--env ...] [--id ID] [--summary] [--config PATH] [COMMAND [ARGS...]]"
        );
    };

    let machine_id = match (args.id, config.client.id.as_str()) {
        (Some(id), _) => sanitize_machine_id(&id).map_err(|e| anyhow!("invalid --id: {}", e))?,
        (None, "") => load_machine_id(),
        (None, id) => sanitize_machine_id(id).map_err(|e| anyhow!("invalid client.id in config: {}", e))?,
    };

    let mut env = env_map_to_list(&config.client.env);
    env.extend(resolve_overlay(&args.env, "client")?);

    let stdin = match (args.stdin, args.stdinfile) {
        (Some(_), Some(_)) => bail!("--stdin and --stdinfile are mutually exclusive"),
        (Some(text), None) => StdinSource::Literal(text),
        (None, Some(path)) => StdinSource::File(path),
        (None, None) => StdinSource::None,
    };

    let options = CallOptions {
        root: PathBuf::from(root),
        name,
        machine_id,
        pid: None,
        start_dir: args.startdir,
        command: args.command,
        env,
        stdin,
        watch_interrupts: true,
    };
    Ok((options, args.summary || config.client.summary))
}
