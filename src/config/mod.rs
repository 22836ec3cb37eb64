pub mod toml_config;
pub mod units;

pub use toml_config::{BatchConfig, CampaignConfig, PendingContactsConfig, TransportKind};

#[cfg(feature = "cli")]
use crate::utils::error::Result;
#[cfg(feature = "cli")]
use crate::utils::validation::{validate_path, Validate};
#[cfg(feature = "cli")]
use chrono::{DateTime, Utc};
#[cfg(feature = "cli")]
use clap::Parser;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "sendout")]
#[command(about = "Runs campaign sendouts in bounded batches against a JSON data snapshot")]
pub struct CliConfig {
    /// Path to the TOML settings file (defaults apply when omitted)
    #[arg(short, long)]
    pub config: Option<String>,

    /// JSON snapshot of sendouts, lists, segments and contacts
    #[arg(short, long, default_value = "./sendouts.json")]
    pub data: String,

    /// Sendout id or sid; every due sendout is processed when omitted
    #[arg(short, long)]
    pub sendout: Option<String>,

    /// Start the clock at this RFC 3339 timestamp (it keeps running from there)
    #[arg(long)]
    pub now: Option<DateTime<Utc>>,

    /// Stop after this many batch invocations per sendout
    #[arg(long)]
    pub max_batches: Option<usize>,

    /// Skip the configured delay between batches
    #[arg(long)]
    pub no_delay: bool,

    /// Write the updated snapshot back to the data file
    #[arg(long)]
    pub write_back: bool,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Log process memory and timing after each batch")]
    pub monitor: bool,
}

#[cfg(feature = "cli")]
impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        validate_path("data", &self.data)?;
        if let Some(config) = &self.config {
            validate_path("config", config)?;
        }
        Ok(())
    }
}
