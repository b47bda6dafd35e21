//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    CliArgs, Command, HistoryArgs, LookupArgs, PruneArgs, ServeArgs, ServeOverrides,
    StoreOverrides,
};

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use apalis_cron::Schedule;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{DEFAULT_CONTENT_TYPE, DEFAULT_RETENTION_SECS};
use crate::infra::db::{DEFAULT_LEDGER_TABLE, is_valid_identifier};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "renderstash";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BLOBS_DIRECTORY: &str = "pages_grid";
const DEFAULT_BLOBS_BUCKET: &str = "pages";
const DEFAULT_SWEEP_CRON: &str = "0 0 * * * *";
const DEFAULT_RESPONSE_BODY_LIMIT_BYTES: u64 = 16 * 1024 * 1024;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub ledger: LedgerSettings,
    pub blobs: BlobSettings,
    pub retention: RetentionSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct BlobSettings {
    pub directory: PathBuf,
    pub bucket: String,
}

impl BlobSettings {
    /// Directory holding this bucket's objects and refs.
    pub fn root(&self) -> PathBuf {
        self.directory.join(&self.bucket)
    }
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub window: Duration,
    pub sweep_cron: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_content_type: String,
    pub response_body_limit_bytes: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("RENDERSTASH").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_database_url_fallback(std::env::var("DATABASE_URL").ok());

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Prune(args)) => raw.apply_store_overrides(&args.stores),
        Some(Command::History(args)) => raw.apply_store_overrides(&args.stores),
        Some(Command::Lookup(args)) => raw.apply_store_overrides(&args.stores),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    ledger: RawLedgerSettings,
    blobs: RawBlobSettings,
    retention: RawRetentionSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_database_url_fallback(&mut self, fallback: Option<String>) {
        if self.database.url.is_none() {
            self.database.url = fallback;
        }
    }

    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_store_overrides(&overrides.stores);

        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(cron) = overrides.retention_sweep_cron.as_ref() {
            self.retention.sweep_cron = Some(cron.clone());
        }
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(table) = overrides.ledger_table.as_ref() {
            self.ledger.table = Some(table.clone());
        }
        if let Some(directory) = overrides.blobs_directory.as_ref() {
            self.blobs.directory = Some(directory.clone());
        }
        if let Some(seconds) = overrides.retention_seconds {
            self.retention.seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            ledger,
            blobs,
            retention,
            cache,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            ledger: build_ledger_settings(ledger)?,
            blobs: build_blob_settings(blobs)?,
            retention: build_retention_settings(retention)?,
            cache: build_cache_settings(cache)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    let acquire_secs = database
        .acquire_timeout_seconds
        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS);
    if acquire_secs == 0 {
        return Err(LoadError::invalid(
            "database.acquire_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(DatabaseSettings {
        url,
        max_connections,
        acquire_timeout: Duration::from_secs(acquire_secs),
    })
}

fn build_ledger_settings(ledger: RawLedgerSettings) -> Result<LedgerSettings, LoadError> {
    let table = ledger
        .table
        .unwrap_or_else(|| DEFAULT_LEDGER_TABLE.to_string());
    if !is_valid_identifier(&table) {
        return Err(LoadError::invalid(
            "ledger.table",
            format!("`{table}` must be a lowercase SQL identifier"),
        ));
    }
    Ok(LedgerSettings { table })
}

fn build_blob_settings(blobs: RawBlobSettings) -> Result<BlobSettings, LoadError> {
    let directory = blobs
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOBS_DIRECTORY));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "blobs.directory",
            "path must not be empty",
        ));
    }

    let bucket = blobs
        .bucket
        .unwrap_or_else(|| DEFAULT_BLOBS_BUCKET.to_string());
    if bucket.is_empty()
        || !bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(LoadError::invalid(
            "blobs.bucket",
            "bucket must be non-empty and contain only letters, digits, `_` or `-`",
        ));
    }

    Ok(BlobSettings { directory, bucket })
}

fn build_retention_settings(
    retention: RawRetentionSettings,
) -> Result<RetentionSettings, LoadError> {
    let seconds = retention.seconds.unwrap_or(DEFAULT_RETENTION_SECS);
    if seconds == 0 {
        return Err(LoadError::invalid(
            "retention.seconds",
            "must be greater than zero",
        ));
    }

    let sweep_cron = retention
        .sweep_cron
        .unwrap_or_else(|| DEFAULT_SWEEP_CRON.to_string());
    Schedule::from_str(&sweep_cron).map_err(|err| {
        LoadError::invalid(
            "retention.sweep_cron",
            format!("`{sweep_cron}` is not a cron expression: {err}"),
        )
    })?;

    Ok(RetentionSettings {
        window: Duration::from_secs(seconds),
        sweep_cron,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_content_type = cache
        .default_content_type
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    if default_content_type.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.default_content_type",
            "must not be empty",
        ));
    }

    let limit = cache
        .response_body_limit_bytes
        .unwrap_or(DEFAULT_RESPONSE_BODY_LIMIT_BYTES);
    if limit == 0 {
        return Err(LoadError::invalid(
            "cache.response_body_limit_bytes",
            "must be greater than zero",
        ));
    }
    let response_body_limit_bytes = usize::try_from(limit).map_err(|_| {
        LoadError::invalid(
            "cache.response_body_limit_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        default_content_type,
        response_body_limit_bytes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLedgerSettings {
    table: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBlobSettings {
    directory: Option<PathBuf>,
    bucket: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetentionSettings {
    seconds: Option<u64>,
    sweep_cron: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    default_content_type: Option<String>,
    response_body_limit_bytes: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }

    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
