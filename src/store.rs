use chrono::Utc;
use sqlx::{Executor, Pool, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::{dto::ReadingSelectResult, record::Record, util::DB};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection unavailable: {0}")]
    ConnectionUnavailable(#[source] sqlx::Error),
    #[error("could not create sensor_readings table: {0}")]
    SchemaCreationFailed(#[source] sqlx::Error),
    #[error("could not write reading: {0}")]
    WriteFailed(#[source] sqlx::Error),
    #[error("could not read readings: {0}")]
    ReadFailed(#[source] sqlx::Error),
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

/// Append-only SQLite table of decoded readings.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let sqlx_options = sqlx::pool::PoolOptions::<DB>::new().after_connect(|conn, _meta| {
            Box::pin(async move {
                let statements = vec![
                    "PRAGMA foreign_keys=ON;",
                    "PRAGMA journal_mode = WAL;",
                    "PRAGMA synchronous = NORMAL;",
                    "PRAGMA busy_timeout = 15000;",
                ];

                for statement in statements {
                    conn.execute(statement).await?;
                }

                Ok(())
            })
        });

        let sqlx_pool: Pool<DB> = sqlx_options
            .connect(database_url)
            .await
            .map_err(StoreError::ConnectionUnavailable)?;

        Ok(Self::from_pool(sqlx_pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the readings table when it does not exist yet. Safe to call on
    /// every start.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(StoreError::ConnectionUnavailable)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sensor_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                address TEXT NOT NULL,
                rssi INTEGER NOT NULL,
                cpu_temp REAL NOT NULL,
                battery_volt REAL NOT NULL,
                temp REAL NOT NULL,
                pressure REAL NOT NULL,
                humidity REAL NOT NULL
            )",
        )
        .execute(&mut *txn)
        .await
        .map_err(StoreError::SchemaCreationFailed)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sensor_readings_timestamp_idx
             ON sensor_readings (timestamp)",
        )
        .execute(&mut *txn)
        .await
        .map_err(StoreError::SchemaCreationFailed)?;

        txn.commit().await.map_err(StoreError::SchemaCreationFailed)?;
        info!("Table sensor_readings ready");

        Ok(())
    }

    /// Appends one row stamped with the current time. The write is committed
    /// when this returns `Ok`.
    pub async fn insert(&self, record: &Record) -> Result<(), StoreError> {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        sqlx::query(
            "INSERT INTO sensor_readings
                (timestamp, address, rssi, cpu_temp, battery_volt, temp, pressure, humidity)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(timestamp)
        .bind(record.address())
        .bind(record.rssi())
        .bind(record.cpu_temperature())
        .bind(record.battery_voltage())
        .bind(record.temperature())
        .bind(record.pressure())
        .bind(record.humidity())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_connection_error(&err) {
                StoreError::ConnectionUnavailable(err)
            } else {
                StoreError::WriteFailed(err)
            }
        })?;

        Ok(())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sensor_readings")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::ReadFailed)?;

        Ok(count)
    }

    /// Most recent rows, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<ReadingSelectResult>, StoreError> {
        sqlx::query_as::<_, ReadingSelectResult>(
            "SELECT id, timestamp, address, rssi, cpu_temp, battery_volt, temp, pressure, humidity
             FROM sensor_readings
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::ReadFailed)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Single connection, so every handle sees the same in-memory database.
#[cfg(test)]
pub(crate) async fn in_memory_pool() -> SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<std::time::Duration>)
        .max_lifetime(None::<std::time::Duration>)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

#[cfg(test)]
pub(crate) async fn in_memory_store() -> LocalStore {
    LocalStore::from_pool(in_memory_pool().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;

    async fn table_sql(store: &LocalStore) -> Vec<String> {
        sqlx::query_as::<_, (String,)>(
            "SELECT sql FROM sqlite_master WHERE tbl_name = 'sensor_readings' ORDER BY name",
        )
        .fetch_all(&store.pool)
        .await
        .unwrap()
        .into_iter()
        .map(|(sql,)| sql)
        .collect()
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let store = in_memory_store().await;
        store.ensure_schema().await.unwrap();
        let first = table_sql(&store).await;

        for _ in 0..3 {
            store.ensure_schema().await.unwrap();
        }

        assert_eq!(table_sql(&store).await, first);
        assert_eq!(first.len(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inserted_reading_reads_back() {
        let store = in_memory_store().await;
        store.ensure_schema().await.unwrap();

        let record =
            parse_line(b"[hub]: 0x00124b000e09465a, -36, 19, 598, 2108, 9776121, 37770").unwrap();
        let before = Utc::now().timestamp_nanos_opt().unwrap();
        store.insert(&record).await.unwrap();

        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(row.timestamp >= before);
        assert_eq!(row.address, "0x00124b000e09465a");
        assert_eq!(row.rssi, -36);
        assert_eq!(row.cpu_temp, 19.0);
        assert_eq!(row.battery_volt, record.battery_voltage());
        assert_eq!(row.temp, 21.08);
        assert_eq!(row.pressure, 977.6121);
        assert_eq!(row.humidity, 37.77);
    }

    #[tokio::test]
    async fn rows_keep_insertion_order() {
        let store = in_memory_store().await;
        store.ensure_schema().await.unwrap();

        for rssi in [-10, -20, -30] {
            let line = format!("[hub]: 0x01, {rssi}, 1, 2, 3, 4, 5");
            store.insert(&parse_line(line.as_bytes()).unwrap()).await.unwrap();
        }

        let rows = store.recent(10).await.unwrap();
        let rssi: Vec<i64> = rows.iter().rev().map(|r| r.rssi).collect();
        assert_eq!(rssi, vec![-10, -20, -30]);
        assert!(rows.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn insert_without_schema_is_write_failure() {
        let store = in_memory_store().await;
        let record = parse_line(b"[hub]: 0x01, 1, 2, 3, 4, 5, 6").unwrap();

        assert!(matches!(
            store.insert(&record).await,
            Err(StoreError::WriteFailed(_))
        ));
    }

    #[tokio::test]
    async fn closed_pool_is_connection_unavailable() {
        let store = in_memory_store().await;
        store.ensure_schema().await.unwrap();
        store.close().await;
        let record = parse_line(b"[hub]: 0x01, 1, 2, 3, 4, 5, 6").unwrap();

        assert!(matches!(
            store.insert(&record).await,
            Err(StoreError::ConnectionUnavailable(_))
        ));
    }
}
