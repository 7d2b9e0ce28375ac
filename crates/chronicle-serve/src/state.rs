//! Application state and configuration.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::cache::{new_cache, ResponseCache};
use crate::exclusion::{Directory, EmptyDirectory, ExclusionFilterResolver, DEFAULT_DIRECTORY_PERMITS};

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080").
    pub bind_addr: String,

    /// Postgres/TimescaleDB connection URL.
    pub database_url: String,

    /// Maximum pool connections.
    pub max_connections: u32,

    /// Valid API tokens (loaded from CHRONICLE_API_TOKENS).
    pub api_tokens: HashSet<String>,

    /// Concurrent role-membership lookups allowed during exclusion
    /// resolution.
    pub directory_permits: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `DATABASE_URL`: Postgres connection URL
    /// - `CHRONICLE_API_TOKENS`: Comma-separated list of valid API tokens
    ///
    /// Optional environment variables:
    /// - `CHRONICLE_BIND_ADDR`: Server bind address (default: "0.0.0.0:8080")
    /// - `CHRONICLE_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `CHRONICLE_DIRECTORY_PERMITS`: Concurrent directory lookups (default: 20)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("CHRONICLE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;

        let max_connections = std::env::var("CHRONICLE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let tokens_str = std::env::var("CHRONICLE_API_TOKENS")
            .map_err(|_| anyhow::anyhow!("CHRONICLE_API_TOKENS environment variable is required"))?;

        let api_tokens: HashSet<String> = tokens_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if api_tokens.is_empty() {
            anyhow::bail!("CHRONICLE_API_TOKENS must contain at least one token");
        }

        let directory_permits = std::env::var("CHRONICLE_DIRECTORY_PERMITS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DIRECTORY_PERMITS);

        tracing::info!(
            bind_addr = %bind_addr,
            token_count = api_tokens.len(),
            directory_permits,
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            database_url,
            max_connections,
            api_tokens,
            directory_permits,
        })
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Postgres pool for ranking queries.
    pub pool: PgPool,

    /// Application configuration.
    pub config: Arc<Config>,

    /// Response cache for expensive queries.
    pub cache: ResponseCache,

    /// Exclusion list resolver.
    pub exclusions: Arc<ExclusionFilterResolver>,
}

impl AppState {
    /// Connect the pool and assemble state.
    ///
    /// `directory` supplies role membership for exclusion expansion; pass
    /// [`EmptyDirectory`] when the embedding service has none.
    pub async fn connect(
        config: Config,
        directory: Arc<dyn Directory>,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self::with_pool(config, pool, directory))
    }

    /// Assemble state over an existing pool.
    pub fn with_pool(config: Config, pool: PgPool, directory: Arc<dyn Directory>) -> Self {
        let exclusions = Arc::new(ExclusionFilterResolver::new(
            pool.clone(),
            directory,
            config.directory_permits,
        ));
        Self {
            pool,
            config: Arc::new(config),
            cache: new_cache(),
            exclusions,
        }
    }
}

/// Default directory used when the caller configures none.
pub fn default_directory() -> Arc<dyn Directory> {
    Arc::new(EmptyDirectory)
}
