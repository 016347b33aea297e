// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Thin helpers around `sqlx` sqlite pools shared by the persistent indices.

use anyhow::Context as _;
use sqlx::{
    SqlitePool,
    query::Query,
    sqlite::{
        SqliteArguments, SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode,
        SqlitePoolOptions, SqliteSynchronous,
    },
};
use std::path::Path;

pub type SqliteQuery<'q> = Query<'q, sqlx::Sqlite, SqliteArguments<'q>>;

/// Opens or creates a database at the specified path
pub async fn open_file(file: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(dir) = file.parent() {
        if !dir.is_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(file)
        .create_if_missing(true);
    Ok(open(options).await?)
}

/// Opens or creates an in-memory database
pub async fn open_memory() -> sqlx::Result<SqlitePool> {
    let options = with_pragmas(
        SqliteConnectOptions::new()
            .in_memory(true)
            .shared_cache(true),
    );
    // A shared-cache in-memory database only lives as long as its single
    // backing connection; spread across a multi-connection pool, each
    // connection gets a distinct empty database. Pin the pool to one
    // connection so every query observes the same schema.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Applies the journaling and cache pragmas every index in this crate relies on.
fn with_pragmas(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .synchronous(SqliteSynchronous::Normal)
        .pragma("temp_store", "memory")
        .auto_vacuum(SqliteAutoVacuum::None)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .read_only(false)
}

/// Opens a database with the journaling and cache pragmas every index in this
/// crate relies on.
pub async fn open(options: SqliteConnectOptions) -> sqlx::Result<SqlitePool> {
    SqlitePool::connect_with(with_pragmas(options)).await
}

/// Initializes the database: applies the `DDL` (Data Definition Language)
/// statements if the schema is not yet present, and records the schema
/// version in a `_meta` table so a later release can detect and migrate an
/// older layout instead of misreading it.
pub async fn init_db<'q>(
    db: &SqlitePool,
    name: &str,
    schema_version: u64,
    ddls: impl IntoIterator<Item = SqliteQuery<'q>>,
) -> anyhow::Result<()> {
    if sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='_meta';")
        .fetch_optional(db)
        .await
        .map_err(|e| anyhow::anyhow!("error looking for {name} database _meta table: {e}"))?
        .is_none()
    {
        let mut tx = db.begin().await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS _meta (version UINT64 NOT NULL UNIQUE)")
            .execute(tx.as_mut())
            .await?;
        sqlx::query("INSERT OR IGNORE INTO _meta (version) VALUES (?)")
            .bind(schema_version as i64)
            .execute(tx.as_mut())
            .await?;
        for ddl in ddls.into_iter() {
            ddl.execute(tx.as_mut()).await?;
        }
        tx.commit().await?;
    }

    let found_version: u64 = sqlx::query_scalar::<_, i64>("SELECT max(version) FROM _meta")
        .fetch_optional(db)
        .await?
        .map(|v| v as u64)
        .with_context(|| format!("invalid {name} database version: no version found"))?;
    anyhow::ensure!(
        found_version == schema_version,
        "unsupported {name} database version {found_version}, expected {schema_version}"
    );

    Ok(())
}
