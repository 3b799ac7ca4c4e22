//! SQLite-backed wallet source.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{FieldStats, SourceError, WalletRecord, WalletSource, FIELDS};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    wallet_name     TEXT    NOT NULL,
    rebalance       INTEGER NOT NULL DEFAULT 0,
    open_order      INTEGER NOT NULL DEFAULT 0,
    open_position   INTEGER NOT NULL DEFAULT 0,
    new_balance     INTEGER NOT NULL DEFAULT 0,
    check_balance   INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(Clone)]
pub struct SqliteWalletSource {
    pool: SqlitePool,
}

impl SqliteWalletSource {
    /// Opens (or creates) the wallet database.
    ///
    /// Accepts either a `sqlite://` URL or a bare file path.
    pub async fn open(location: &str) -> Result<Self, SourceError> {
        let url = if location.starts_with("sqlite:") {
            location.to_string()
        } else {
            format!("sqlite://{}", location)
        };

        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SourceError::InvalidUrl {
                url: url.clone(),
                message: e.to_string(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(url = %url, "Wallet database opened");
        Ok(Self { pool })
    }

    /// Appends records to the table.
    #[cfg(test)]
    pub async fn insert(&self, records: &[WalletRecord]) -> Result<(), SourceError> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                "INSERT INTO wallets (
                    wallet_name, rebalance, open_order, open_position, new_balance, check_balance
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&r.wallet_name)
            .bind(r.rebalance as i32)
            .bind(r.open_order as i32)
            .bind(r.open_position as i32)
            .bind(r.new_balance as i32)
            .bind(r.check_balance as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> WalletRecord {
    let flag = |name: &str| row.get::<i64, _>(name) == 1;
    WalletRecord {
        wallet_name: row.get("wallet_name"),
        rebalance: flag("rebalance"),
        open_order: flag("open_order"),
        open_position: flag("open_position"),
        new_balance: flag("new_balance"),
        check_balance: flag("check_balance"),
    }
}

#[async_trait]
impl WalletSource for SqliteWalletSource {
    async fn count(&self) -> Result<u64, SourceError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wallets")
            .fetch_one(&self.pool)
            .await?;
        Ok(total as u64)
    }

    async fn fetch_range(&self, offset: u64, limit: u64) -> Result<Vec<WalletRecord>, SourceError> {
        let rows = sqlx::query(
            "SELECT wallet_name, rebalance, open_order, open_position, new_balance, check_balance
             FROM wallets ORDER BY rowid LIMIT ?1 OFFSET ?2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn sample(&self, limit: u64) -> Result<Vec<WalletRecord>, SourceError> {
        self.fetch_range(0, limit).await
    }

    async fn random(&self, limit: u64) -> Result<Vec<WalletRecord>, SourceError> {
        let rows = sqlx::query(
            "SELECT wallet_name, rebalance, open_order, open_position, new_balance, check_balance
             FROM wallets ORDER BY RANDOM() LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn field_stats(&self) -> Result<FieldStats, SourceError> {
        let total = self.count().await?;

        let mut counts = Vec::with_capacity(FIELDS.len());
        for (field, _) in FIELDS {
            // Column names come from the fixed FIELDS table, never from input.
            let sql = format!("SELECT COUNT(*) FROM wallets WHERE {} = 1", field);
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
            counts.push((field.to_string(), count as u64));
        }

        Ok(FieldStats { total, counts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::events_from_records;

    async fn open_temp() -> (tempfile::TempDir, SqliteWalletSource) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("wallets.db");
        let source = SqliteWalletSource::open(db_path.to_str().unwrap())
            .await
            .unwrap();
        (dir, source)
    }

    fn seed() -> Vec<WalletRecord> {
        vec![
            WalletRecord {
                rebalance: true,
                new_balance: true,
                ..WalletRecord::new("wallet_001")
            },
            WalletRecord::new("wallet_002"),
            WalletRecord {
                open_order: true,
                ..WalletRecord::new("wallet_003")
            },
            WalletRecord {
                open_order: true,
                check_balance: true,
                ..WalletRecord::new("wallet_004")
            },
        ]
    }

    #[tokio::test]
    async fn test_insert_and_fetch_range() {
        let (_dir, source) = open_temp().await;
        source.insert(&seed()).await.unwrap();

        assert_eq!(source.count().await.unwrap(), 4);

        let page = source.fetch_range(1, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].wallet_name, "wallet_002");
        assert_eq!(page[1], seed()[2]);

        let events = events_from_records(&source.fetch_range(0, 10).await.unwrap());
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_field_stats() {
        let (_dir, source) = open_temp().await;
        source.insert(&seed()).await.unwrap();

        let stats = source.field_stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.count("open_order"), 2);
        assert_eq!(stats.count("open_position"), 0);
        assert_eq!(stats.percentage("rebalance"), 25.0);
        assert_eq!(stats.counts.len(), 5);
    }

    #[tokio::test]
    async fn test_sample_is_table_order() {
        let (_dir, source) = open_temp().await;
        source.insert(&seed()).await.unwrap();

        let sample = source.sample(3).await.unwrap();
        let names: Vec<_> = sample.iter().map(|r| r.wallet_name.as_str()).collect();
        assert_eq!(names, ["wallet_001", "wallet_002", "wallet_003"]);
        assert_eq!(source.sample(10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_random_draws_distinct_stored_rows() {
        let (_dir, source) = open_temp().await;
        source.insert(&seed()).await.unwrap();

        let drawn = source.random(2).await.unwrap();
        assert_eq!(drawn.len(), 2);
        assert_ne!(drawn[0].wallet_name, drawn[1].wallet_name);
        for record in &drawn {
            assert!(seed().contains(record));
        }
        assert_eq!(source.random(5).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_random_on_empty_table() {
        let (_dir, source) = open_temp().await;
        assert!(source.random(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_accepts_url() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("w.db").display());
        let source = SqliteWalletSource::open(&url).await.unwrap();
        assert_eq!(source.count().await.unwrap(), 0);
    }
}
