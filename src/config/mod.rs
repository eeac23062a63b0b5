//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::types::{Expiry, RecomputeMode};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tierstash";
const DEFAULT_NAMESPACE: &str = "tierstash";
const DEFAULT_VOLATILE_CAPACITY: u64 = 10_000;
const DEFAULT_WORKER_CONCURRENCY: u64 = 4;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Command-line arguments for the tierstash operator binary.
#[derive(Debug, Parser)]
#[command(name = "tierstash", version, about = "Two-tier function result cache tooling")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TIERSTASH_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Apply the embedded database migrations.
    Migrate,
    /// Clear every row lock left behind by an interrupted background recompute.
    #[command(name = "clear-locks")]
    ClearLocks,
    /// Print the durable record stored under a key.
    Inspect(InspectArgs),
    /// Print the key a call with the given arguments would use.
    #[command(name = "derive-key")]
    DeriveKey(DeriveKeyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    /// Cache key as printed in invocation logs.
    #[arg(value_name = "KEY")]
    pub key: String,
}

#[derive(Debug, Args, Clone)]
pub struct DeriveKeyArgs {
    /// Qualified function name (`module::path.name`); omit for key-value store keys.
    #[arg(long, value_name = "NAME")]
    pub function: Option<String>,

    /// Function cache version.
    #[arg(long, value_name = "VERSION", default_value = "0")]
    pub version: String,

    /// Extra key prefix, as used by key-value stores.
    #[arg(long, value_name = "PREFIX", default_value = "")]
    pub prefix: String,

    /// Positional call arguments, each taken as a plain value.
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    pub args: Vec<String>,
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

    /// Override the cache namespace mixed into every key.
    #[arg(long = "cache-namespace", value_name = "NAME", global = true)]
    pub cache_namespace: Option<String>,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
pub struct CacheSettings {
    pub namespace: String,
    pub volatile_capacity: NonZeroUsize,
    pub worker_concurrency: NonZeroUsize,
    pub use_volatile: bool,
    pub use_durable: bool,
    pub default_recompute: RecomputeMode,
    pub default_expiry: Expiry,
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

    builder = builder.add_source(Environment::with_prefix("TIERSTASH").separator("__"));

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
        if let Some(namespace) = overrides.cache_namespace.as_ref() {
            self.cache.namespace = Some(namespace.clone());
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

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
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

    let timeout_secs = database
        .acquire_timeout_seconds
        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "database.acquire_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(DatabaseSettings {
        url,
        max_connections,
        acquire_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let namespace = cache
        .namespace
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    if namespace.is_empty() {
        return Err(LoadError::invalid("cache.namespace", "must not be empty"));
    }

    let volatile_capacity = non_zero_usize(
        cache.volatile_capacity.unwrap_or(DEFAULT_VOLATILE_CAPACITY),
        "cache.volatile_capacity",
    )?;
    let worker_concurrency = non_zero_usize(
        cache
            .worker_concurrency
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
        "cache.worker_concurrency",
    )?;

    let default_recompute = match cache.default_recompute {
        Some(mode) => RecomputeMode::from_str(mode.trim())
            .map_err(|err| LoadError::invalid("cache.default_recompute", err.to_string()))?,
        None => RecomputeMode::default(),
    };

    Ok(CacheSettings {
        namespace,
        volatile_capacity,
        worker_concurrency,
        use_volatile: cache.use_volatile.unwrap_or(true),
        use_durable: cache.use_durable.unwrap_or(true),
        default_recompute,
        default_expiry: cache.default_expiry.unwrap_or_default(),
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
struct RawCacheSettings {
    namespace: Option<String>,
    volatile_capacity: Option<u64>,
    worker_concurrency: Option<u64>,
    use_volatile: Option<bool>,
    use_durable: Option<bool>,
    default_recompute: Option<String>,
    default_expiry: Option<Expiry>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert_eq!(settings.logging.format, LogFormat::Compact);
        assert_eq!(settings.database.url, None);
        assert_eq!(settings.database.max_connections.get(), 8);
        assert_eq!(settings.cache.namespace, "tierstash");
        assert_eq!(settings.cache.volatile_capacity.get(), 10_000);
        assert_eq!(settings.cache.worker_concurrency.get(), 4);
        assert_eq!(settings.cache.default_recompute, RecomputeMode::Auto);
        assert_eq!(settings.cache.default_expiry, Expiry::Never);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.logging.level = Some("info".to_string());
        raw.cache.namespace = Some("from-file".to_string());

        raw.apply_overrides(&GlobalOverrides {
            log_level: Some("debug".to_string()),
            log_json: Some(true),
            cache_namespace: Some("from-cli".to_string()),
            ..Default::default()
        });
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.cache.namespace, "from-cli");
    }

    #[test]
    fn blank_database_url_is_absent() {
        let mut raw = RawSettings::default();
        raw.database.url = Some("   ".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.database.url.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let cases: Vec<(&str, fn(&mut RawSettings))> = vec![
            ("logging.level", |raw| raw.logging.level = Some("loud".into())),
            ("database.max_connections", |raw| {
                raw.database.max_connections = Some(0)
            }),
            ("cache.volatile_capacity", |raw| {
                raw.cache.volatile_capacity = Some(0)
            }),
            ("cache.worker_concurrency", |raw| {
                raw.cache.worker_concurrency = Some(0)
            }),
            ("cache.default_recompute", |raw| {
                raw.cache.default_recompute = Some("sometimes".into())
            }),
            ("cache.namespace", |raw| raw.cache.namespace = Some(" ".into())),
        ];

        for (expected, mutate) in cases {
            let mut raw = RawSettings::default();
            mutate(&mut raw);
            match Settings::from_raw(raw) {
                Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected),
                other => panic!("expected invalid `{expected}`, got {other:?}"),
            }
        }
    }

    #[test]
    fn recompute_mode_is_case_insensitive() {
        let mut raw = RawSettings::default();
        raw.cache.default_recompute = Some("AlwaysDefer".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.cache.default_recompute, RecomputeMode::AlwaysDefer);
    }

    #[test]
    fn parse_derive_key_arguments() {
        let args = CliArgs::try_parse_from([
            "tierstash",
            "derive-key",
            "--function",
            "shop::catalog.price",
            "--version",
            "3",
            "sku-1",
            "EUR",
        ])
        .expect("parse derive-key");

        match args.command {
            Command::DeriveKey(derive) => {
                assert_eq!(derive.function.as_deref(), Some("shop::catalog.price"));
                assert_eq!(derive.version, "3");
                assert_eq!(derive.prefix, "");
                assert_eq!(derive.args, vec!["sku-1".to_string(), "EUR".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parse_inspect_with_global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "tierstash",
            "inspect",
            "AbCdEfGhIjKlMnOp",
            "--database-url",
            "postgres://localhost/cache",
        ])
        .expect("parse inspect");

        assert_eq!(
            args.overrides.database_url.as_deref(),
            Some("postgres://localhost/cache")
        );
        assert!(matches!(args.command, Command::Inspect(InspectArgs { ref key }) if key == "AbCdEfGhIjKlMnOp"));
    }

    #[test]
    fn parse_maintenance_commands() {
        let migrate = CliArgs::try_parse_from(["tierstash", "migrate"]).expect("parse migrate");
        assert!(matches!(migrate.command, Command::Migrate));

        let clear = CliArgs::try_parse_from(["tierstash", "clear-locks"]).expect("parse clear");
        assert!(matches!(clear.command, Command::ClearLocks));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(CliArgs::try_parse_from(["tierstash"]).is_err());
    }
}
