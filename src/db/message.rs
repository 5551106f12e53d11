use std::time::Duration;

use sqlx::{types::Json, Connection as _, SqliteConnection};

use super::Table;
use crate::message::{Message, UnixTime};

impl Message {
    /// Inserts the message into the pending table and returns its new identity.
    pub async fn insert(&self, db: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
        self.insert_into(db, Table::Pending).await
    }

    async fn insert_into(&self, db: &mut SqliteConnection, table: Table) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(&format!(
            "
            INSERT INTO {} (
                created_at, try_after, started_at, processed_at,
                header, elapsed, topic, error, tries, on_success, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            ",
            table.as_str()
        ))
        .bind(self.created_at)
        .bind(self.try_after)
        .bind(self.started_at)
        .bind(self.processed_at)
        .bind(Json(&self.header))
        .bind(self.elapsed)
        .bind(&self.topic)
        .bind(&self.error)
        .bind(self.tries)
        .bind(Json(&self.on_success))
        .bind(Json(&self.payload))
        .fetch_one(db)
        .await
    }

    /// Selects up to `limit` messages of `topic` that can be claimed at `now`, oldest first.
    ///
    /// A message is eligible when it is not processed, its `try_after` has passed and it is
    /// either unclaimed or its claim is older than `lease`.
    pub async fn candidates(
        db: &mut SqliteConnection,
        topic: &str,
        now: UnixTime,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as(
            "
            SELECT * FROM messages
            WHERE topic = $1
                AND processed_at = 0
                AND try_after <= $2
                AND (started_at = 0 OR started_at < $3)
            ORDER BY id ASC
            LIMIT $4
            ",
        )
        .bind(topic)
        .bind(now)
        .bind(now - lease)
        .bind(limit as i64)
        .fetch_all(db)
        .await
    }

    /// Marks the message as started at `now`.
    ///
    /// The update only applies if the row is still eligible at `now` under `lease` and still
    /// carries the `started_at` value this copy was read with, so of several concurrent claims
    /// on the same candidate exactly one succeeds, and a copy read before a retry was scheduled
    /// cannot claim the row ahead of its new `try_after`. Returns `false` when the claim lost.
    pub async fn claim(
        &mut self,
        db: &mut SqliteConnection,
        now: UnixTime,
        lease: Duration,
    ) -> Result<bool, sqlx::Error> {
        let id = self.id.ok_or(sqlx::Error::RowNotFound)?;

        let affected = sqlx::query(
            "
            UPDATE messages SET started_at = $1
            WHERE id = $2
                AND started_at = $3
                AND processed_at = 0
                AND try_after <= $1
                AND (started_at = 0 OR started_at < $4)
            ",
        )
        .bind(now)
        .bind(id)
        .bind(self.started_at)
        .bind(now - lease)
        .execute(db)
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(false);
        }

        self.started_at = now;
        Ok(true)
    }

    /// Writes the outcome of a retryable attempt back to the pending row.
    ///
    /// Returns `false` if the lease taken at `claimed_at` no longer holds.
    pub async fn reschedule(
        &self,
        db: &mut SqliteConnection,
        claimed_at: UnixTime,
    ) -> Result<bool, sqlx::Error> {
        let id = self.id.ok_or(sqlx::Error::RowNotFound)?;

        let affected = sqlx::query(
            "
            UPDATE messages
            SET try_after = $1, started_at = $2, processed_at = $3,
                elapsed = $4, error = $5, tries = $6
            WHERE id = $7 AND started_at = $8
            ",
        )
        .bind(self.try_after)
        .bind(self.started_at)
        .bind(self.processed_at)
        .bind(self.elapsed)
        .bind(&self.error)
        .bind(self.tries)
        .bind(id)
        .bind(claimed_at)
        .execute(db)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Moves the message from the pending table into the archive.
    ///
    /// The pending row is deleted and the archive row inserted in one transaction. The
    /// archive assigns its own identity, which is returned. Returns `None` and writes
    /// nothing if the lease taken at `claimed_at` no longer holds.
    pub async fn archive(
        &self,
        db: &mut SqliteConnection,
        claimed_at: UnixTime,
    ) -> Result<Option<i64>, sqlx::Error> {
        let id = self.id.ok_or(sqlx::Error::RowNotFound)?;

        let mut tx = db.begin().await?;

        let deleted = sqlx::query("DELETE FROM messages WHERE id = $1 AND started_at = $2")
            .bind(id)
            .bind(claimed_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let archived = self.insert_into(&mut tx, Table::Archive).await?;

        tx.commit().await?;

        Ok(Some(archived))
    }

    pub async fn get(
        db: &mut SqliteConnection,
        table: Table,
        id: i64,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as(&format!("SELECT * FROM {} WHERE id = $1", table.as_str()))
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list(
        db: &mut SqliteConnection,
        table: Table,
        topic: Option<&str>,
    ) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as(&format!(
            "SELECT * FROM {} WHERE ($1 IS NULL OR topic = $1) ORDER BY id ASC",
            table.as_str()
        ))
        .bind(topic)
        .fetch_all(db)
        .await
    }

    pub async fn count(
        db: &mut SqliteConnection,
        table: Table,
        topic: Option<&str>,
    ) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE ($1 IS NULL OR topic = $1)",
            table.as_str()
        ))
        .bind(topic)
        .fetch_one(db)
        .await?;

        Ok(count as u64)
    }

    /// Deletes archived messages processed before `before`.
    pub async fn prune_archive(
        db: &mut SqliteConnection,
        before: UnixTime,
    ) -> Result<u64, sqlx::Error> {
        Ok(
            sqlx::query("DELETE FROM archived_messages WHERE processed_at < $1")
                .bind(before)
                .execute(db)
                .await?
                .rows_affected(),
        )
    }
}
