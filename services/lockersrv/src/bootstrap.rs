//! Command-line arguments and startup helpers

use std::path::PathBuf;

use clap::Parser;

use crate::config::AppConfig;
use crate::error::Result;

/// Command-line arguments for lockersrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "lockersrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Kerong locker-bank controller bridge",
    long_about = None
)]
pub struct Args {
    /// Configuration file (.yaml, .yml, .toml or .json)
    #[arg(short = 'c', long, env = "LOCKERSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, env = "LOCKERSRV_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Controller host, overrides the configuration
    #[arg(long)]
    pub host: Option<String>,

    /// Controller TCP port, overrides the configuration
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Load the configuration and apply command-line overrides
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        if let Some(host) = &self.host {
            config.controller.host = host.clone();
        }
        if let Some(port) = self.port {
            config.controller.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}
