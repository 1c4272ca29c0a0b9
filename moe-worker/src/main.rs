//! Entry point for the MOE compute worker.

use std::{env, time::Duration};

use moe_common::{config::WorkerConfig, prelude::*, tracing_support::initialize_tracing};

use crate::controller::Controller;

mod controller;
mod heartbeat;
mod job_runner;
mod parser;
mod process;

/// Instructions on how to use this program.
const USAGE: &str = "Usage: moe-worker [config.toml]\n\n\
    Reads MOE_USERNAME and MOE_PASSWORD from the environment to log in.";

/// Our main entry point.
#[tokio::main]
#[instrument(level = "debug")]
async fn main() -> Result<()> {
    initialize_tracing();

    // Parse our arguments (manually, so we don't need to drag in a ton of
    // libraries for a single optional positional argument).
    let args = env::args().collect::<Vec<_>>();
    if args.len() > 2 {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    match args.get(1).map(String::as_str) {
        Some("--help") => {
            println!("{USAGE}");
            std::process::exit(0);
        }
        Some("--version") => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        _ => {}
    }

    let config = match args.get(1) {
        Some(path) => WorkerConfig::load_from_file(Path::new(path))?,
        None => WorkerConfig::default(),
    };

    let controller = Controller::new(config)?;

    let username = env::var("MOE_USERNAME").context("MOE_USERNAME is not set")?;
    let password = env::var("MOE_PASSWORD").context("MOE_PASSWORD is not set")?;
    controller.login(&username, &password).await?;
    info!("logged in as {username}");

    controller.start();

    tokio::signal::ctrl_c()
        .await
        .context("error waiting for ctrl-c")?;
    info!("shutting down");
    controller.stop().await?;

    // Give the Job Runner a moment to run the cancellation-flush path for an
    // in-progress `minimize` job before we exit.
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
