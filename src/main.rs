use std::io::Result;
use std::net::IpAddr;

use clap::Parser;
use env_logger::Builder;
use log::{debug, info, LevelFilter};

use bgpling::agent;
use bgpling::config;
use bgpling::hooks::Hooks;

#[derive(Parser)]
#[clap(name = "bgpling", version, about = "BGP-4 speaker daemon")]
struct Args {
    /// Path to the server config
    #[clap(value_name = "CONFIG")]
    config_path: String,

    /// IP address to listen on (overrides the config)
    #[clap(short, long)]
    address: Option<IpAddr>,

    /// TCP port to listen on (overrides the config)
    #[clap(short, long)]
    port: Option<u16>,

    /// Sets the level of logging verbosity
    #[clap(short, parse(from_occurrences))]
    verbose: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (bgpling_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgpling"), bgpling_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", bgpling_level, other_level);

    let mut config = config::from_file(&args.config_path)?;
    if let Some(address) = args.address {
        config.listen_addr = address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    debug!("Found {} peers in {}", config.peers.len(), args.config_path);

    agent::serve(config, Hooks::default()).await
}
