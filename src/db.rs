use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub type DbPool = DatabaseConnection;

/// Pool options derived from the application settings
pub fn connect_options(cfg: &AppConfig) -> ConnectOptions {
    let mut opt = ConnectOptions::new(cfg.database_url.clone());
    opt.max_connections(cfg.db_max_connections)
        .min_connections(cfg.db_min_connections.min(cfg.db_max_connections))
        .connect_timeout(Duration::from_secs(cfg.db_connect_timeout_secs))
        .acquire_timeout(Duration::from_secs(cfg.db_acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(cfg.db_idle_timeout_secs))
        .sqlx_logging(false);
    opt
}

/// Opens the pool described by `cfg`.
///
/// # Errors
/// `ServiceError::DatabaseError` when the database is unreachable.
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let opt = connect_options(cfg);
    gauge!("storefront_db.max_connections", cfg.db_max_connections as f64);
    info!(
        max_connections = cfg.db_max_connections,
        sqlite = cfg.database_url.starts_with("sqlite:"),
        "connecting to database"
    );

    Database::connect(opt).await.map_err(|e| {
        error!("Database connection failed: {}", e);
        ServiceError::DatabaseError(e)
    })
}

/// Applies pending schema migrations; already applied ones are skipped
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    let started = Instant::now();
    match crate::migrator::Migrator::up(pool, None).await {
        Ok(()) => {
            info!(elapsed = ?started.elapsed(), "database schema up to date");
            Ok(())
        }
        Err(e) => {
            error!(elapsed = ?started.elapsed(), "migrations failed: {}", e);
            Err(ServiceError::DatabaseError(e))
        }
    }
}

/// Round trip used by the health endpoint
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    let started = Instant::now();
    let result = pool.ping().await;
    let elapsed = started.elapsed();

    match result {
        Ok(()) => {
            debug!(?elapsed, "database ping ok");
            gauge!("storefront_db.connection_latency", elapsed.as_millis() as f64);
            Ok(())
        }
        Err(e) => {
            error!(?elapsed, "database ping failed: {}", e);
            counter!("storefront_db.connection_failures", 1);
            Err(ServiceError::DatabaseError(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> AppConfig {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "x".repeat(64),
            "127.0.0.1".into(),
            0,
            "test".into(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 4;
        cfg
    }

    #[test]
    fn min_connections_never_exceed_max() {
        let opt = connect_options(&memory_config());
        assert_eq!(opt.get_max_connections(), Some(1));
        assert_eq!(opt.get_min_connections(), Some(1));
    }

    #[tokio::test]
    async fn connects_and_migrates_sqlite() {
        let pool = establish_connection_from_app_config(&memory_config())
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        // Applying twice is a no-op
        run_migrations(&pool).await.unwrap();
        assert!(check_connection(&pool).await.is_ok());
    }
}
