use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use courier::{config, telemetry, CentralPostOffice};

/// Central post office daemon.
#[derive(Parser)]
#[command(name = "cpo", version)]
struct Cli {
    /// Path to the broker configuration file.
    #[arg(long, default_value = "cpo.toml")]
    config: PathBuf,

    /// Path to the client roster / secrets file.
    #[arg(long, default_value = "clients.toml")]
    secrets: PathBuf,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose.max(1));

    if let Err(err) = run(&cli) {
        tracing::error!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> courier::Result<()> {
    let config = config::load_cpo_config(&cli.config)?;
    let clients = config::load_clients(&cli.secrets)?;

    let _cpo = CentralPostOffice::start(config, clients, cli.secrets.clone())?;
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}
