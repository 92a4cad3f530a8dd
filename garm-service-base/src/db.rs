use std::error::Error;

use garm_common::config::DbSqliteConfig;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, Pool, Sqlite, SqliteConnection};
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./db/migration/sqlite");

fn connect_options(config: &DbSqliteConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(std::path::Path::new(config.database.as_str()))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(config.foreign_keys)
}

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<Pool<Sqlite>, Box<dyn Error>> {
    info!("DB pool: sqlite://{}", config.database);
    let conn_options = connect_options(config);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(conn_options)
        .await
        .map_err(|e| e.into())
}

pub async fn sqlite_migrate(config: &DbSqliteConfig) -> Result<(), Box<dyn Error>> {
    info!("DB migration: sqlite://{}", config.database);
    let conn_options = connect_options(config);
    let mut conn = SqliteConnection::connect_with(&conn_options).await?;
    MIGRATOR.run(&mut conn).await?;
    let _ = conn.close().await;
    Ok(())
}
