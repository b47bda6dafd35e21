use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the renderstash binary.
#[derive(Debug, Parser)]
#[command(name = "renderstash", version, about = "Prerender page cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RENDERSTASH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Provision the ledger and run the history expiry worker.
    Serve(Box<ServeArgs>),
    /// Remove expired ledger records once and exit.
    Prune(PruneArgs),
    /// Print the ledger record for a URL as JSON.
    History(HistoryArgs),
    /// Look a URL up through the cache and report what would be served.
    Lookup(LookupArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the ledger table name.
    #[arg(long = "ledger-table", value_name = "NAME")]
    pub ledger_table: Option<String>,

    /// Override the blob store directory.
    #[arg(long = "blobs-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub blobs_directory: Option<PathBuf>,

    /// Override the history retention window.
    #[arg(long = "retention-seconds", value_name = "SECONDS")]
    pub retention_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the cron expression driving history expiry.
    #[arg(long = "retention-sweep-cron", value_name = "CRON")]
    pub retention_sweep_cron: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PruneArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Page URL whose record should be printed.
    #[arg(value_name = "URL", value_hint = ValueHint::Url)]
    pub url: String,
}

#[derive(Debug, Args, Clone)]
pub struct LookupArgs {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Page URL to look up.
    #[arg(value_name = "URL", value_hint = ValueHint::Url)]
    pub url: String,
}
