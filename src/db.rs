use crate::models::file::FileEntry;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("id already present")]
    Conflict,
    #[error("row {0} holds an out-of-range timestamp")]
    BadTimestamp(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Position after the last row of a sweep page, ordered by `(expires_at, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepCursor {
    expires_at: i64,
    id: String,
}

#[derive(Debug, Default)]
pub struct ExpiredPage {
    pub ids: Vec<String>,
    /// Set when the page came back full and more rows may follow.
    pub next: Option<SweepCursor>,
}

#[derive(Clone)]
pub struct Db(pub SqlitePool);

impl Db {
    pub async fn connect_and_migrate(path: &str, max_connections: u32) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Db(pool))
    }

    pub async fn exists(&self, id: &str) -> Result<bool, DbError> {
        let row = sqlx::query("SELECT 1 FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.0)
            .await?;
        Ok(row.is_some())
    }

    /// Inserts a new row. The primary key makes this the single point where
    /// two writers of the same id are told apart: the loser gets `Conflict`.
    pub async fn insert(&self, entry: &FileEntry) -> Result<(), DbError> {
        sqlx::query("INSERT INTO files(id, filename, size, mime_type, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(&entry.id)
            .bind(&entry.filename)
            .bind(entry.size)
            .bind(&entry.mime_type)
            .bind(entry.created_at.timestamp_millis())
            .bind(entry.expires_at.timestamp_millis())
            .execute(&self.0)
            .await
            .map_err(|e| {
                if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                    DbError::Conflict
                } else {
                    DbError::Sqlx(e)
                }
            })?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<FileEntry>, DbError> {
        let row = sqlx::query("SELECT id, filename, size, mime_type, created_at, expires_at FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.0)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Returns whether a row was removed. Missing rows are not an error.
    pub async fn delete(&self, id: &str) -> Result<bool, DbError> {
        let res = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.0)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// One page of ids whose `expires_at <= before`, continuing after `after`.
    pub async fn list_expired_before(
        &self,
        before: DateTime<Utc>,
        after: Option<&SweepCursor>,
        limit: u32,
    ) -> Result<ExpiredPage, DbError> {
        let (after_ts, after_id) = match after {
            Some(c) => (c.expires_at, c.id.as_str()),
            None => (i64::MIN, ""),
        };
        let rows = sqlx::query(
            "SELECT id, expires_at FROM files \
             WHERE expires_at <= ? AND (expires_at > ? OR (expires_at = ? AND id > ?)) \
             ORDER BY expires_at ASC, id ASC LIMIT ?",
        )
        .bind(before.timestamp_millis())
        .bind(after_ts)
        .bind(after_ts)
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&self.0)
        .await?;

        let next = match rows.last() {
            Some(last) if rows.len() as u64 >= u64::from(limit) => Some(SweepCursor {
                expires_at: last.get("expires_at"),
                id: last.get("id"),
            }),
            _ => None,
        };
        let ids = rows.into_iter().map(|r| r.get::<String, _>("id")).collect();
        Ok(ExpiredPage { ids, next })
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<FileEntry, DbError> {
    let id: String = row.get("id");
    let created_at = DateTime::<Utc>::from_timestamp_millis(row.get("created_at"))
        .ok_or_else(|| DbError::BadTimestamp(id.clone()))?;
    let expires_at = DateTime::<Utc>::from_timestamp_millis(row.get("expires_at"))
        .ok_or_else(|| DbError::BadTimestamp(id.clone()))?;
    Ok(FileEntry {
        filename: row.get("filename"),
        size: row.get("size"),
        mime_type: row.get("mime_type"),
        created_at,
        expires_at,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> Db {
        let path = dir.path().join("meta.sqlite3");
        Db::connect_and_migrate(path.to_str().unwrap(), 4).await.unwrap()
    }

    fn entry(id: &str, expires_at: DateTime<Utc>) -> FileEntry {
        FileEntry {
            id: id.to_string(),
            filename: "notes.txt".to_string(),
            size: 10,
            mime_type: Some("text/plain; charset=utf-8".to_string()),
            created_at: expires_at - ChronoDuration::days(7),
            expires_at,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[actix_web::test]
    async fn insert_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let e = entry("abc123", at(0));

        assert!(!db.exists("abc123").await.unwrap());
        db.insert(&e).await.unwrap();
        assert!(db.exists("abc123").await.unwrap());
        assert_eq!(db.get("abc123").await.unwrap(), Some(e));
        assert_eq!(db.get("zzz999").await.unwrap(), None);
    }

    #[actix_web::test]
    async fn duplicate_insert_is_conflict() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        db.insert(&entry("abc123", at(0))).await.unwrap();

        let err = db.insert(&entry("abc123", at(5))).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict));
    }

    #[actix_web::test]
    async fn concurrent_inserts_of_same_id_admit_one() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;

        let attempts = (0..8).map(|i| {
            let db = db.clone();
            async move { db.insert(&entry("race01", at(i))).await }
        });
        let results = futures_util::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, DbError::Conflict)));
    }

    #[actix_web::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        db.insert(&entry("abc123", at(0))).await.unwrap();

        assert!(db.delete("abc123").await.unwrap());
        assert!(!db.delete("abc123").await.unwrap());
        assert!(!db.delete("never1").await.unwrap());
    }

    #[actix_web::test]
    async fn expired_listing_pages_without_gaps() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        for (i, id) in ["aaaaa1", "aaaaa2", "aaaaa3", "aaaaa4", "aaaaa5"].iter().enumerate() {
            // two rows share each timestamp to exercise the id tiebreak
            db.insert(&entry(id, at((i / 2) as i64))).await.unwrap();
        }
        db.insert(&entry("live01", at(1_000))).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<SweepCursor> = None;
        loop {
            let page = db.list_expired_before(at(10), cursor.as_ref(), 2).await.unwrap();
            // rows removed mid-sweep must not shift later pages
            for id in &page.ids {
                db.delete(id).await.unwrap();
            }
            seen.extend(page.ids);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen, vec!["aaaaa1", "aaaaa2", "aaaaa3", "aaaaa4", "aaaaa5"]);
        assert!(db.exists("live01").await.unwrap());
    }

    #[actix_web::test]
    async fn expiry_boundary_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        db.insert(&entry("edge01", at(60))).await.unwrap();

        let page = db.list_expired_before(at(59), None, 10).await.unwrap();
        assert!(page.ids.is_empty());
        let page = db.list_expired_before(at(60), None, 10).await.unwrap();
        assert_eq!(page.ids, vec!["edge01"]);
    }
}
