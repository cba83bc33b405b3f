//! SQLite record store for identity keys and their public addresses.

use faucet_types::FaucetWallet;
use parking_lot::Mutex;
use rusqlite::{Connection, Result as SqliteResult};

pub struct Db {
    conn: Mutex<Option<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, String>) -> Result<T, String> {
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err("Database is closed".to_string()),
        }
    }

    /// Encrypted private key for an identity slot, if one was stored.
    pub fn get_encrypted_key(&self, worker_id: i64) -> Result<Option<String>, String> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT encrypted_key FROM faucet_keys WHERE worker_id = ?1",
                rusqlite::params![worker_id],
                |row| row.get::<_, String>(0),
            );
            match result {
                Ok(key) if key.is_empty() => Ok(None),
                Ok(key) => Ok(Some(key)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(format!("Database error: {}", e)),
            }
        })
    }

    pub fn store_encrypted_key(&self, worker_id: i64, encrypted_key: &str) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO faucet_keys (worker_id, encrypted_key)
                 VALUES (?1, ?2)
                 ON CONFLICT(worker_id) DO UPDATE SET
                    encrypted_key = excluded.encrypted_key,
                    updated_at = datetime('now')",
                rusqlite::params![worker_id, encrypted_key],
            )
            .map_err(|e| format!("Failed to store key for worker {}: {}", worker_id, e))?;
            Ok(())
        })
    }

    /// Records which address an identity slot signs as. Keyed by slot, so
    /// repeated startups overwrite rather than duplicate.
    pub fn upsert_wallet(&self, worker_id: i64, address: &str) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO faucet_wallets (worker_id, address)
                 VALUES (?1, ?2)
                 ON CONFLICT(worker_id) DO UPDATE SET
                    address = excluded.address,
                    updated_at = datetime('now')",
                rusqlite::params![worker_id, address],
            )
            .map_err(|e| format!("Failed to upsert wallet for worker {}: {}", worker_id, e))?;
            Ok(())
        })
    }

    pub fn list_wallets(&self) -> Result<Vec<FaucetWallet>, String> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT worker_id, address, updated_at
                     FROM faucet_wallets
                     ORDER BY worker_id ASC",
                )
                .map_err(|e| format!("Failed to prepare query: {}", e))?;

            let wallets = stmt
                .query_map([], |row| {
                    Ok(FaucetWallet {
                        worker_id: row.get(0)?,
                        address: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                })
                .map_err(|e| format!("Failed to query: {}", e))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(wallets)
        })
    }

    /// True if `key` has a rate-limit entry expiring after `now` (unix seconds).
    pub fn rate_limit_active(&self, key: &str, now: i64) -> Result<bool, String> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM rate_limits WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, now],
                    |row| row.get(0),
                )
                .map_err(|e| format!("Failed to read rate limit '{}': {}", key, e))?;
            Ok(count > 0)
        })
    }

    pub fn set_rate_limit(&self, key: &str, expires_at: i64) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rate_limits (key, expires_at)
                 VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                rusqlite::params![key, expires_at],
            )
            .map_err(|e| format!("Failed to set rate limit '{}': {}", key, e))?;
            Ok(())
        })
    }

    /// Deletes entries that expired at or before `now`. Returns how many.
    pub fn purge_rate_limits(&self, now: i64) -> Result<usize, String> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM rate_limits WHERE expires_at <= ?1",
                rusqlite::params![now],
            )
            .map_err(|e| format!("Failed to purge rate limits: {}", e))
        })
    }

    /// Closes the underlying connection. Later calls fail with "closed".
    pub fn close(&self) -> Result<(), String> {
        let conn = self.conn.lock().take();
        match conn {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| format!("Failed to close database: {}", e)),
            None => Ok(()),
        }
    }
}

fn create_tables(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS faucet_keys (
            worker_id INTEGER PRIMARY KEY,
            encrypted_key TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS faucet_wallets (
            worker_id INTEGER PRIMARY KEY,
            address TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rate_limits (
            key TEXT PRIMARY KEY,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}
