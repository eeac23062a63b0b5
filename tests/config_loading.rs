use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serial_test::serial;
use tempfile::NamedTempFile;
use tierstash::cache::CacheConfig;
use tierstash::config::{self, CliArgs, Command, GlobalOverrides, LogFormat};
use tierstash::domain::types::{Expiry, RecomputeMode};

fn cli(config_file: Option<PathBuf>, overrides: GlobalOverrides) -> CliArgs {
    CliArgs {
        config_file,
        overrides,
        command: Command::Migrate,
    }
}

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
#[serial]
fn file_values_are_loaded_and_validated() {
    let file = config_file(
        r#"
[logging]
level = "debug"
json = true

[database]
url = "postgres://localhost/cache"
max_connections = 3

[cache]
namespace = "shop"
volatile_capacity = 500
worker_concurrency = 2
use_volatile = false
default_recompute = "Defer"
default_expiry = "10m"
"#,
    );

    let settings = config::load(&cli(Some(file.path().to_path_buf()), GlobalOverrides::default()))
        .expect("settings load");

    assert_eq!(settings.logging.format, LogFormat::Json);
    assert_eq!(settings.database.url.as_deref(), Some("postgres://localhost/cache"));
    assert_eq!(settings.database.max_connections.get(), 3);
    assert_eq!(settings.cache.namespace, "shop");
    assert_eq!(settings.cache.volatile_capacity.get(), 500);
    assert!(!settings.cache.use_volatile);
    assert_eq!(settings.cache.default_recompute, RecomputeMode::Defer);
    assert_eq!(
        settings.cache.default_expiry,
        Expiry::After(Duration::from_secs(600))
    );

    let cache = CacheConfig::from(&settings.cache);
    assert_eq!(cache.worker_concurrency, 2);
    assert_eq!(cache.default_policy().recompute, RecomputeMode::Defer);
}

#[test]
#[serial]
fn numeric_expiry_means_seconds() {
    let file = config_file("[cache]\ndefault_expiry = 90\n");
    let settings = config::load(&cli(Some(file.path().to_path_buf()), GlobalOverrides::default()))
        .expect("settings load");
    assert_eq!(
        settings.cache.default_expiry,
        Expiry::After(Duration::from_secs(90))
    );
}

#[test]
#[serial]
fn environment_overrides_file_and_cli_overrides_environment() {
    let file = config_file("[cache]\nnamespace = \"from-file\"\nworker_concurrency = 2\n");

    // SAFETY: tests touching the environment are serialized.
    unsafe {
        std::env::set_var("TIERSTASH__CACHE__NAMESPACE", "from-env");
        std::env::set_var("TIERSTASH__CACHE__WORKER_CONCURRENCY", "6");
    }

    let from_env = config::load(&cli(Some(file.path().to_path_buf()), GlobalOverrides::default()));
    let from_cli = config::load(&cli(
        Some(file.path().to_path_buf()),
        GlobalOverrides {
            cache_namespace: Some("from-cli".into()),
            ..Default::default()
        },
    ));

    unsafe {
        std::env::remove_var("TIERSTASH__CACHE__NAMESPACE");
        std::env::remove_var("TIERSTASH__CACHE__WORKER_CONCURRENCY");
    }

    let from_env = from_env.expect("settings load");
    assert_eq!(from_env.cache.namespace, "from-env");
    assert_eq!(from_env.cache.worker_concurrency.get(), 6);
    assert_eq!(from_cli.expect("settings load").cache.namespace, "from-cli");
}

#[test]
#[serial]
fn invalid_expiry_is_rejected() {
    let file = config_file("[cache]\ndefault_expiry = \"tomorrow\"\n");
    assert!(config::load(&cli(Some(file.path().to_path_buf()), GlobalOverrides::default())).is_err());
}

#[test]
#[serial]
fn missing_explicit_file_is_an_error() {
    let missing = PathBuf::from("/nonexistent/tierstash-config.toml");
    assert!(config::load(&cli(Some(missing), GlobalOverrides::default())).is_err());
}
