use clap::Parser;
use std::process;
use tailguard::cli::Args;
use tailguard::config::Config;
use tailguard::viewer::Viewer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr so they never mix with log output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            process::exit(2);
        }
    };

    let mut viewer = Viewer::new(config);

    match viewer.run().await {
        Ok(_) => {
            info!("tailguard completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("tailguard failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
