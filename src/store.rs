//! Durable allocation records.
//!
//! One file (`bolt.db`) under the state directory, one table
//! (`ipallocator`). The single-byte key `0x00` holds the raw bytes of the
//! last allocated address; every other key is the raw big-endian address
//! of a live allocation, its value the owning pid in decimal ASCII.
//! SQLite's locking serializes concurrent read-write openers; a blocked
//! invocation waits for its turn via the busy timeout.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::addr;
use crate::error::{NetworkError, Result};

/// File the allocation database is stored in.
pub const DB_FILE: &str = "bolt.db";

/// Table holding the ip key value store.
const IP_BUCKET: &str = "ipallocator";

/// Reserved key for the allocator cursor.
const CURSOR_KEY: [u8; 1] = [0];

/// How long a write-side opener waits for a concurrent invocation to
/// release the database.
const LOCK_WAIT: Duration = Duration::from_secs(10);

pub struct AllocStore {
    pool: SqlitePool,
}

impl AllocStore {
    /// Open the database read-write, creating the file if needed.
    pub async fn open(state_dir: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(Self::db_path(state_dir))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(LOCK_WAIT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Open the database read-only. Fails with `DatabaseDoesNotExist`
    /// when no allocation has ever been recorded.
    pub async fn open_read_only(state_dir: &Path) -> Result<Self> {
        let path = Self::db_path(state_dir);
        if !path.exists() {
            return Err(NetworkError::DatabaseDoesNotExist);
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(LOCK_WAIT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn db_path(state_dir: &Path) -> PathBuf {
        state_dir.join(DB_FILE)
    }

    /// Create the allocator bucket if it does not exist. Idempotent.
    pub async fn ensure_bucket(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
            IP_BUCKET
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The last address handed out by the allocator, if any.
    pub async fn cursor(&self) -> Result<Option<Ipv4Addr>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(&format!(
            "SELECT value FROM {} WHERE key = ?",
            IP_BUCKET
        ))
        .bind(CURSOR_KEY.to_vec())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((raw,)) => match addr::from_bytes(&raw) {
                Some(IpAddr::V4(ip)) => Ok(Some(ip)),
                _ => Err(NetworkError::CorruptRecord(format!(
                    "cursor value {:?} is not an IPv4 address",
                    raw
                ))),
            },
        }
    }

    /// Record an accepted allocation: `(ip -> pid)` plus the advanced
    /// cursor, committed in a single transaction.
    pub async fn commit_allocation(&self, ip: Ipv4Addr, pid: i32) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
            IP_BUCKET
        ))
        .bind(ip.octets().to_vec())
        .bind(pid.to_string().into_bytes())
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
            IP_BUCKET
        ))
        .bind(CURSOR_KEY.to_vec())
        .bind(ip.octets().to_vec())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record a caller-chosen address without touching the cursor.
    pub async fn put_allocation(&self, ip: Ipv4Addr, pid: i32) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
            IP_BUCKET
        ))
        .bind(ip.octets().to_vec())
        .bind(pid.to_string().into_bytes())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every live allocation in bucket insertion order. The cursor record
    /// is never reported.
    pub async fn allocations(&self) -> Result<Vec<(IpAddr, i32)>> {
        let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(&format!(
            "SELECT key, value FROM {} ORDER BY rowid",
            IP_BUCKET
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::new();
        for (key, value) in rows {
            // skip last ip
            if key.len() == 1 && key[0] == 0 {
                continue;
            }

            let ip = addr::from_bytes(&key).ok_or_else(|| {
                NetworkError::CorruptRecord(format!("key {:?} is not an address", key))
            })?;

            let pid = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .ok_or_else(|| {
                    NetworkError::CorruptRecord(format!(
                        "parsing pid {:?} as int failed",
                        value
                    ))
                })?;

            entries.push((ip, pid));
        }

        Ok(entries)
    }
}
