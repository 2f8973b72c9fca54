//! Process configuration from flags and environment

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "concytec-workflow")]
#[command(about = "CONCYTEC institutional workflow synchronization service")]
#[command(version)]
pub struct Config {
    /// SQLite connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:concytec.db?mode=rwc")]
    pub database_url: String,

    /// Maximum pooled database connections
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Address the HTTP server listens on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind: SocketAddr,

    /// JSON workflow definitions
    #[arg(long, env = "WORKFLOW_CONFIG", default_value = "config/workflows.json")]
    pub workflow_config: PathBuf,

    /// Items fetched per discovery page
    #[arg(long, env = "DISCOVERY_PAGE_SIZE", default_value_t = crate::store::DEFAULT_PAGE_SIZE)]
    pub discovery_page_size: u32,
}
