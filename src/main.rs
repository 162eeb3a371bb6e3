//! Streamhub server - Binary Entry Point
//!
//! Exit codes: 0 clean shutdown, 1 runtime failure, 2 bad arguments or
//! configuration, 3 event log required but unavailable.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use streamhub::config::{LogFormat, ServerConfig};
use streamhub::server::Server;
use streamhub::telemetry::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "streamhub-server", version, about = "Event backbone for the control plane")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listen_addr`
    #[arg(long)]
    listen: Option<String>,

    /// Override `data_dir`
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run without the durable event log
    #[arg(long)]
    memory_only: bool,

    /// `text` or `json`
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.memory_only {
            config.event_log = false;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = ServerConfig::load(cli.config.as_deref()).and_then(|mut config| {
        cli.apply(&mut config);
        config.validate().map(|()| config)
    });
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("streamhub-server: {}", e);
            return ExitCode::from(2);
        }
    };

    init_tracing(config.log_format);

    let result = match Server::build(config) {
        Ok(server) => server.serve().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "streamhub-server failed");
            ExitCode::from(e.exit_code())
        }
    }
}
