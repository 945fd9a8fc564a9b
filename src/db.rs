use anyhow::Result;
use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use std::env;

pub type Db = Pool<Postgres>;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn connect() -> Result<Db> {
    let url = env::var("DATABASE_URL").expect("DATABASE_URL not set");
    Ok(Pool::<Postgres>::connect(&url).await?)
}

/// True when the database is missing a migration this binary embeds.
/// A database without the `_sqlx_migrations` table counts as pending.
pub async fn has_pending_migrations(db: &Db) -> bool {
    let applied: Vec<i64> =
        match sqlx::query_scalar("SELECT version FROM _sqlx_migrations ORDER BY version")
            .fetch_all(db)
            .await
        {
            Ok(versions) => versions,
            Err(_) => return true,
        };
    MIGRATOR.iter().any(|m| !applied.contains(&m.version))
}
