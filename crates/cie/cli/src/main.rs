//! Command-line front end for the CIE SDK

use std::path::PathBuf;
use std::time::Duration;

use cie_apdu_transport_pcsc::{PcscConfig, PcscDeviceManager};
use cie_sdk::{CieConfig, CieReader};
use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

mod commands;
mod utils;

use commands::Commands;
use utils::{Encoding, reader};

#[derive(Parser)]
#[command(version, about = "Read attributes, certificates and eMRTD data from a CIE")]
struct Cli {
    /// Optional reader name to use (waits on every reader if not specified)
    #[arg(short, long)]
    reader: Option<String>,

    /// Debug level output
    #[arg(short, long)]
    verbose: bool,

    /// Operation timeout in milliseconds (defaults to the configured value)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Configuration file (defaults to ~/.cie/cie.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Encoding used to print binary results
    #[arg(short, long, value_enum, default_value_t = Encoding::Base64)]
    encoding: Encoding,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let manager = PcscDeviceManager::new()?;
    if matches!(cli.command, Commands::List) {
        return reader::list_readers(&manager);
    }

    let config = match &cli.config {
        Some(path) => CieConfig::load_from(path)?,
        None => CieConfig::load()?,
    };
    let connector = manager.connector(cli.reader.clone(), PcscConfig::default());
    let cie = CieReader::new(connector, &config)?;
    info!(idp_url = %cie.idp_url(), "Waiting for a CIE");

    let timeout = cli.timeout.map(Duration::from_millis);
    commands::run(&cie, cli.command, timeout, cli.encoding)
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    // RUST_LOG directives win over the verbosity flag
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .init();
}
