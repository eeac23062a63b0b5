use std::process;

use time::format_description::well_known::Rfc3339;
use tierstash::{
    application::{error::AppError, repos::RowLock},
    cache::{ArgToken, derive_key},
    config,
    domain::entities::{CacheKey, FunctionId},
    infra::{db::PostgresRepositories, error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const VALUE_PREVIEW_CHARS: usize = 200;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(source = report.source, error = %report.render(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(source = report.source, error = %report.render(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command {
        config::Command::Migrate => run_migrate(&settings).await,
        config::Command::ClearLocks => run_clear_locks(&settings).await,
        config::Command::Inspect(args) => run_inspect(&settings, args).await,
        config::Command::DeriveKey(args) => run_derive_key(&settings, args),
    }
}

async fn connect(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresRepositories::connect(
        database_url,
        settings.database.max_connections.get(),
        settings.database.acquire_timeout,
    )
    .await
    .map_err(InfraError::from)?;

    Ok(PostgresRepositories::new(pool))
}

async fn run_migrate(settings: &config::Settings) -> Result<(), AppError> {
    let repositories = connect(settings).await?;
    PostgresRepositories::run_migrations(repositories.pool())
        .await
        .map_err(InfraError::from)?;
    info!(target = "tierstash::migrate", "migrations applied");
    Ok(())
}

async fn run_clear_locks(settings: &config::Settings) -> Result<(), AppError> {
    let repositories = connect(settings).await?;
    repositories.health_check().await.map_err(InfraError::from)?;
    let cleared = repositories.clear_all_locks().await?;
    info!(target = "tierstash::clear_locks", cleared, "row locks cleared");
    println!("cleared {cleared} row lock(s)");
    Ok(())
}

async fn run_inspect(settings: &config::Settings, args: config::InspectArgs) -> Result<(), AppError> {
    let key = args.key.trim();
    if key.len() != CacheKey::LEN {
        return Err(AppError::validation(format!(
            "cache keys are {} characters long, got {}",
            CacheKey::LEN,
            key.len()
        )));
    }

    let repositories = connect(settings).await?;
    let stored = repositories
        .fetch_entry(&CacheKey::from_stored(key))
        .await?
        .ok_or(AppError::NotFound)?;
    let entry = &stored.entry;

    println!("key:          {}", entry.key);
    println!("function:     {}", entry.function);
    println!("version:      {}", entry.version);
    println!("namespace:    {}", entry.namespace);
    println!("effort:       {}", entry.effort);
    println!("modified_at:  {}", format_timestamp(entry.modified_at));
    println!(
        "expires_hint: {}",
        entry
            .expires_hint
            .map_or_else(|| "never".to_string(), format_timestamp)
    );
    println!(
        "locked_at:    {}",
        stored
            .locked_at
            .map_or_else(|| "unlocked".to_string(), format_timestamp)
    );
    println!("value bytes:  {}", entry.value.len());
    println!("value:        {}", preview(&entry.value));
    Ok(())
}

fn run_derive_key(settings: &config::Settings, args: config::DeriveKeyArgs) -> Result<(), AppError> {
    let function = args.function.as_deref().map(parse_function).transpose()?;
    let tokens: Vec<ArgToken> = args.args.into_iter().map(ArgToken::from).collect();
    let key = derive_key(
        &settings.cache.namespace,
        &args.prefix,
        &args.version,
        function.as_ref(),
        &tokens,
    );
    println!("{key}");
    Ok(())
}

fn parse_function(qualified: &str) -> Result<FunctionId, AppError> {
    match qualified.trim().rsplit_once('.') {
        Some((module, name)) if !module.is_empty() && !name.is_empty() => {
            Ok(FunctionId::new(module, name))
        }
        _ => Err(AppError::validation(format!(
            "function must be written as `module.name`, got `{qualified}`"
        ))),
    }
}

fn format_timestamp(value: time::OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

fn preview(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    let mut preview: String = text.chars().take(VALUE_PREVIEW_CHARS).collect();
    if text.chars().count() > VALUE_PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}
