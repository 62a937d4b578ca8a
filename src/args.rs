use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use live_session_core::config;
use live_session_core::webrtc::Role;

#[derive(Parser, Debug)]
#[command(name = "live-session")]
#[command(author = "Live Session Team")]
#[command(version = "0.2.0")]
#[command(about = "Run a synthetic media session against an SFU signaling endpoint", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/live-session.toml")]
    pub config: PathBuf,

    /// Signaling WebSocket URL (overrides the config file)
    #[arg(short, long)]
    pub url: Option<String>,

    /// Session role
    #[arg(short, long, value_enum, default_value_t = RoleArg::Viewer)]
    pub role: RoleArg,

    /// Stream identifier (regime id)
    #[arg(short, long)]
    pub stream_id: String,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Broadcaster,
    Viewer,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Broadcaster => Role::Broadcaster,
            RoleArg::Viewer => Role::Viewer,
        }
    }
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
