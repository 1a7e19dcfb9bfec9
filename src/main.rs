//! seriesgate - serve cached or freshly fetched rows for a signed token
//!
//! One synchronous invocation per run: verify the token, sweep expired
//! rows, fetch from upstream on a cache miss, and print the row set for
//! the token's request identity.

use std::sync::Arc;

use clap::Parser;

use seriesgate::cli::{render_json, render_text, Cli};
use seriesgate::clock::SystemClock;
use seriesgate::fetch::HttpFetcher;
use seriesgate::gateway::Gateway;
use seriesgate::store::RowStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.load_config()?;
    config.validate()?;

    let clock = Arc::new(SystemClock);
    let store = RowStore::open(&cli.db, &config, clock.clone())?;
    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let gateway = Gateway::new(&config, store, fetcher, clock);

    let rows = gateway.handle(&cli.token).await?;

    if cli.json {
        println!("{}", render_json(&rows));
    } else {
        print!("{}", render_text(&rows));
    }
    Ok(())
}
