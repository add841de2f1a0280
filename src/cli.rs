use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "playercache",
    about = "Loopback caching proxy for segmented video playback"
)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./playercache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Media URL to print the loopback form of once the proxy is up. May be repeated.
    #[arg(long = "url", value_name = "URL")]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
