use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, EntityTrait,
    QuerySelect, Select,
};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::{debug, error, info};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl DbConfig {
    /// In-memory SQLite keeps one database per connection, so the pool is
    /// pinned to a single connection there.
    fn is_memory_sqlite(&self) -> bool {
        self.url.starts_with("sqlite::memory:") || self.url.contains("mode=memory")
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool to the database with custom configuration
///
/// # Errors
/// Returns a `ServiceError::DatabaseError` if the connection cannot be established
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    let (max, min) = if config.is_memory_sqlite() {
        (1, 1)
    } else {
        (config.max_connections, config.min_connections)
    };

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(max)
        .min_connections(min)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    gauge!("storefront_db.max_connections", max as f64);
    info!("Connecting to database with max_connections={}", max);

    let db_pool = Database::connect(opt).await.map_err(|e| {
        error!("Database connection failed: {}", e);
        ServiceError::DatabaseError(e)
    })?;

    info!("Database connection pool established successfully");
    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Runs the embedded migrations
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Running database migrations");
    let start = std::time::Instant::now();

    let result = crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(ServiceError::DatabaseError);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!("Database migrations completed successfully in {:?}", elapsed),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    let start = std::time::Instant::now();
    let result = pool.ping().await.map_err(ServiceError::DatabaseError);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            debug!("Database connection check successful in {:?}", elapsed);
            gauge!("storefront_db.connection_latency", elapsed.as_millis() as f64);
        }
        Err(e) => {
            error!("Database connection check failed after {:?}: {}", elapsed, e);
            counter!("storefront_db.connection_failures", 1);
        }
    }

    result
}

/// Adds `FOR UPDATE` on backends with row locks. SQLite serializes writers
/// at the database level, so the query is left untouched there.
pub fn for_update<E, C>(query: Select<E>, conn: &C) -> Select<E>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    match conn.get_database_backend() {
        DbBackend::Sqlite => query,
        _ => query.lock_exclusive(),
    }
}
