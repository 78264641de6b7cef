//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, ExpiryColumns};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachescope";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const MAX_KEY_PREFIX_LEN: usize = 32;
const MAX_IDENTIFIER_LEN: usize = 63;
/// One hundred years; longer defaults are almost certainly unit mistakes.
const MAX_DEFAULT_LIFETIME_SECS: u64 = 100 * 365 * 86_400;

/// Command-line arguments for the cachescope binary.
#[derive(Debug, Parser)]
#[command(name = "cachescope", version, about = "Cachescope cache maintenance")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CACHESCOPE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Apply pending database migrations.
    Migrate,
    /// Print the number of stored cache entries.
    Stats,
    /// Remove every cache entry.
    Flush,
    /// Remove entries carrying any of the given tags.
    #[command(name = "flush-tag")]
    FlushTag(FlushTagArgs),
    /// Remove entries tagged with a record (`{table}_{uid}`).
    #[command(name = "flush-record")]
    FlushRecord(FlushRecordArgs),
    /// Delete expired entries.
    Gc,
}

#[derive(Debug, Args, Clone)]
pub struct FlushTagArgs {
    /// Tags to flush.
    #[arg(value_name = "TAG", required = true, num_args = 1..)]
    pub tags: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct FlushRecordArgs {
    /// Record table, e.g. `pages`.
    #[arg(value_name = "TABLE")]
    pub table: String,

    /// Record uid.
    #[arg(value_name = "UID")]
    pub uid: u64,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT", global = true)]
    pub database_max_connections: Option<u32>,

    /// Toggle lz4 compression of newly written entries.
    #[arg(
        long = "cache-compress",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub cache_compress: Option<bool>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
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
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_lifetime: NonZeroU64,
    pub max_entries: NonZeroU64,
    pub max_deletions_per_pass: NonZeroU64,
    pub compress: bool,
    pub key_prefix: String,
    pub page_table: String,
    pub expiry_tables: BTreeMap<String, ExpiryColumns>,
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

    builder = builder.add_source(Environment::with_prefix("CACHESCOPE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(count) = overrides.database_max_connections {
            self.database.max_connections = Some(count);
        }
        if let Some(compress) = overrides.cache_compress {
            self.cache.compress = Some(compress);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            logging,
            database,
            cache,
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

    let max_connections = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = NonZeroU32::new(max_connections).ok_or_else(|| {
        LoadError::invalid("database.max_connections", "must be greater than zero")
    })?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let default_lifetime = non_zero_u64(
        cache
            .default_lifetime_seconds
            .unwrap_or(defaults.default_lifetime),
        "cache.default_lifetime_seconds",
    )?;
    if default_lifetime.get() > MAX_DEFAULT_LIFETIME_SECS {
        return Err(LoadError::invalid(
            "cache.default_lifetime_seconds",
            format!("must not exceed {MAX_DEFAULT_LIFETIME_SECS} seconds"),
        ));
    }
    let max_entries = non_zero_u64(
        cache.max_entries.unwrap_or(defaults.max_entries),
        "cache.max_entries",
    )?;
    let max_deletions_per_pass = non_zero_u64(
        cache
            .max_deletions_per_pass
            .unwrap_or(defaults.max_deletions_per_pass),
        "cache.max_deletions_per_pass",
    )?;

    let key_prefix = cache.key_prefix.unwrap_or(defaults.key_prefix);
    if key_prefix.is_empty() || key_prefix.len() > MAX_KEY_PREFIX_LEN {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            format!("must be 1 to {MAX_KEY_PREFIX_LEN} characters"),
        ));
    }
    if !key_prefix
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
    {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "may only contain ASCII letters, digits, `_` and `-`",
        ));
    }

    let page_table = cache.page_table.unwrap_or(defaults.page_table);
    if !is_identifier(&page_table) {
        return Err(LoadError::invalid(
            "cache.page_table",
            format!("`{page_table}` is not a valid table name"),
        ));
    }

    let expiry_tables = cache.expiry_tables.unwrap_or(defaults.expiry_tables);
    for (table, columns) in &expiry_tables {
        let names = [Some(table), columns.start.as_ref(), columns.end.as_ref()];
        if let Some(name) = names.into_iter().flatten().find(|name| !is_identifier(name)) {
            return Err(LoadError::invalid(
                "cache.expiry_tables",
                format!("`{name}` is not a valid table or column name"),
            ));
        }
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        default_lifetime,
        max_entries,
        max_deletions_per_pass,
        compress: cache.compress.unwrap_or(defaults.compress),
        key_prefix,
        page_table,
        expiry_tables,
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
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    default_lifetime_seconds: Option<u64>,
    max_entries: Option<u64>,
    max_deletions_per_pass: Option<u64>,
    compress: Option<bool>,
    key_prefix: Option<String>,
    page_table: Option<String>,
    expiry_tables: Option<BTreeMap<String, ExpiryColumns>>,
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Plain SQL identifier: letter or underscore first, then letters, digits, underscores.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
