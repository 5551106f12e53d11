use std::str::FromStr as _;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::{
    config::Config,
    db::Table,
    error::Error,
    message::{Message, UnixTime},
};

/// Handle to the SQLite database holding the pending and archive tables.
#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(&Config::default()).await
    }

    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::from_pool(pool).await
    }

    /// Opens a store that lives as long as the returned handle.
    ///
    /// In-memory SQLite databases are private to their connection, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { db: pool })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Pending messages, optionally restricted to one topic, oldest first.
    pub async fn pending(&self, topic: Option<&str>) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::list(&mut conn, Table::Pending, topic).await?)
    }

    /// Archived messages, optionally restricted to one topic, oldest first.
    pub async fn archived(&self, topic: Option<&str>) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::list(&mut conn, Table::Archive, topic).await?)
    }

    pub async fn pending_message(&self, id: i64) -> Result<Option<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::get(&mut conn, Table::Pending, id).await?)
    }

    pub async fn pending_count(&self, topic: Option<&str>) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::count(&mut conn, Table::Pending, topic).await?)
    }

    pub async fn archived_count(&self, topic: Option<&str>) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::count(&mut conn, Table::Archive, topic).await?)
    }

    /// Removes archived messages processed before `before`, returning how many were removed.
    pub async fn prune_archive(&self, before: impl Into<UnixTime>) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::prune_archive(&mut conn, before.into()).await?)
    }
}
