//! virtualbox-cpi: serve one CPI request.
//!
//! Reads a JSON request from stdin and writes the JSON response to stdout.
//! CPI failures are part of the response, so the exit status is non-zero
//! only when the configuration or the I/O itself is broken.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use virtualbox_cpi::config::Config;
use virtualbox_cpi::dispatch::Dispatcher;
use virtualbox_cpi::{cpi, logging};

/// BOSH CPI for VirtualBox
#[derive(Parser, Debug)]
#[command(name = "virtualbox-cpi", version, about = "BOSH CPI for VirtualBox")]
struct Args {
    /// Path to the CPI configuration (JSON, or TOML by extension)
    #[arg(long = "configPath", alias = "config")]
    config_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init();

    let config = Config::load(&args.config_path)?;

    let mut request = Vec::new();
    std::io::stdin()
        .read_to_end(&mut request)
        .context("Reading request from stdin")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let response = runtime.block_on(async {
        let runner = cpi::runner_for(&config)?;
        Dispatcher::new(config, runner).handle_bytes(&request).await
    })?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response).context("Writing response")?;
    stdout.write_all(b"\n").context("Writing response")?;
    stdout.flush().context("Writing response")?;

    info!(bytes = response.len(), "Response written");
    Ok(())
}
