//! Shared SQLite bootstrap for the durable queue and the sqlite vector store.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use libsqlite3_sys::{SQLITE_OK, sqlite3, sqlite3_api_routines, sqlite3_auto_extension};
use sqlite_vec::sqlite3_vec_init;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::errors::{PipelineError, PipelineResult};

static SQLITE_VEC_INIT_RC: OnceLock<i32> = OnceLock::new();

fn init_sqlite_vec_once() -> PipelineResult<()> {
    let rc = *SQLITE_VEC_INIT_RC.get_or_init(|| unsafe {
        type SqliteVecInitFn =
            unsafe extern "C" fn(*mut sqlite3, *mut *const i8, *const sqlite3_api_routines) -> i32;

        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), SqliteVecInitFn>(
            sqlite3_vec_init as *const (),
        )))
    });

    if rc == SQLITE_OK {
        Ok(())
    } else {
        Err(PipelineError::SqliteVec(format!(
            "sqlite3_auto_extension failed with code {rc}"
        )))
    }
}

/// Open (creating if needed) the database file and run migrations.
pub async fn open_pool(db_path: &Path) -> PipelineResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    create_pool(options, 8).await
}

/// Private in-memory database. A single connection, since every
/// `:memory:` connection is a separate database.
pub async fn open_in_memory_pool() -> PipelineResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);

    create_pool(options, 1).await
}

async fn create_pool(options: SqliteConnectOptions, max_connections: u32) -> PipelineResult<SqlitePool> {
    init_sqlite_vec_once()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA synchronous = NORMAL")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA cache_size = -64000")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> PipelineResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
