pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod queries;
pub mod services;
pub mod state;

pub use config::Config;
pub use database::{DbConn, DbPool};
pub use error::{Error, Result};
pub use state::AppState;

/// Embedded schema migrations (messages, classifications, chunks, chat,
/// metadata, FTS trigger, ANN indexes).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Load configuration from environment variables
pub fn load_config() -> Result<Config> {
    Ok(Config::load()?)
}

/// Initialize tracing subscriber with environment filter
///
/// This function sets up the tracing subscriber for the application.
/// It reads the RUST_LOG environment variable to set the log level.
/// If RUST_LOG is not set, it defaults to "info" level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

/// Connects the pool and applies pending migrations.
pub async fn init_db(config: &Config) -> Result<DbPool> {
    use secrecy::ExposeSecret;

    let pool = DbPool::connect(config.database.connection_string().expose_secret())
        .await
        .map_err(Error::Sqlx)?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
