use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;

use super::{
    AccountRecord, DRAIN_ACCOUNT_ID, SOURCE_ACCOUNT_ID, TransactionRecord, TransferRecord,
    UsageLogEntry, UsageLogRecord, UsageWindow,
};
use crate::GatewayError;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("account not found: {id}")]
    AccountNotFound { id: String },
    #[error("invalid transfer amount: {amount}")]
    InvalidAmount { amount: i64 },
    #[error("account {id} does not accept {direction}")]
    DirectionNotAllowed { id: String, direction: &'static str },
    #[error("insufficient funds in {id}: balance={balance} required={required}")]
    InsufficientFunds {
        id: String,
        balance: i64,
        required: i64,
    },
}

impl From<SqliteStoreError> for GatewayError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::AccountNotFound { id } => GatewayError::NotFound {
                what: format!("account {id}"),
            },
            SqliteStoreError::InvalidAmount { amount } => GatewayError::InvalidRequest {
                reason: format!("transfer amount must be positive, got {amount}"),
            },
            SqliteStoreError::DirectionNotAllowed { id, direction } => GatewayError::InvalidState {
                reason: format!("account {id} does not accept {direction}"),
            },
            SqliteStoreError::InsufficientFunds {
                balance, required, ..
            } => GatewayError::InsufficientFunds { balance, required },
            other => GatewayError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Bootstraps the two system singleton accounts. INSERT OR IGNORE makes
    /// concurrent bootstrap first-writer-wins: a second creator finds the
    /// rows already present and treats that as success.
    pub async fn ensure_system_accounts(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO accounts
                     (id, user_id, balance, accepts_input, accepts_output, allow_negative, kind)
                 VALUES (?1, NULL, 0, 0, 1, 1, 'source')",
                rusqlite::params![SOURCE_ACCOUNT_ID],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO accounts
                     (id, user_id, balance, accepts_input, accepts_output, allow_negative, kind)
                 VALUES (?1, NULL, 0, 1, 0, 0, 'drain')",
                rusqlite::params![DRAIN_ACCOUNT_ID],
            )?;
            Ok(())
        })
        .await?
    }

    /// Idempotent per-user account creation. A uniqueness collision means
    /// another writer got there first; the existing row is returned.
    pub async fn ensure_user_account(
        &self,
        user_id: &str,
    ) -> Result<AccountRecord, SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<AccountRecord, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let account_id = format!("acct:user:{user_id}");
            conn.execute(
                "INSERT OR IGNORE INTO accounts
                     (id, user_id, balance, accepts_input, accepts_output, allow_negative, kind)
                 VALUES (?1, ?2, 0, 1, 1, 0, 'user')",
                rusqlite::params![account_id, user_id],
            )?;
            load_account_by_user(&conn, &user_id)?.ok_or(SqliteStoreError::AccountNotFound {
                id: account_id,
            })
        })
        .await?
    }

    pub async fn account(&self, id: &str) -> Result<Option<AccountRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<AccountRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            load_account(&conn, &id)
        })
        .await?
    }

    pub async fn user_account(
        &self,
        user_id: &str,
    ) -> Result<Option<AccountRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<AccountRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            load_account_by_user(&conn, &user_id)
        })
        .await?
    }

    /// Moves `amount` between two accounts: two transaction rows, two balance
    /// deltas, and the transfer row, all inside one SQLite transaction. Any
    /// validation failure rolls the whole unit back, so a rejected transfer
    /// leaves no rows and no balance change behind.
    pub async fn transfer(
        &self,
        from_account: &str,
        to_account: &str,
        amount: i64,
        description: &str,
    ) -> Result<TransferRecord, SqliteStoreError> {
        let path = self.path.clone();
        let from_account = from_account.to_string();
        let to_account = to_account.to_string();
        let description = description.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<TransferRecord, SqliteStoreError> {
            if amount <= 0 {
                return Err(SqliteStoreError::InvalidAmount { amount });
            }

            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            // Immediate: the balance read and the balance update must
            // serialize with concurrent transfers touching the same account.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let from = load_account(&tx, &from_account)?.ok_or_else(|| {
                SqliteStoreError::AccountNotFound {
                    id: from_account.clone(),
                }
            })?;
            let to = load_account(&tx, &to_account)?.ok_or_else(|| {
                SqliteStoreError::AccountNotFound {
                    id: to_account.clone(),
                }
            })?;

            if !from.accepts_output {
                return Err(SqliteStoreError::DirectionNotAllowed {
                    id: from.id,
                    direction: "output",
                });
            }
            if !to.accepts_input {
                return Err(SqliteStoreError::DirectionNotAllowed {
                    id: to.id,
                    direction: "input",
                });
            }
            if !from.allow_negative && from.balance < amount {
                return Err(SqliteStoreError::InsufficientFunds {
                    id: from.id,
                    balance: from.balance,
                    required: amount,
                });
            }

            tx.execute(
                "INSERT INTO transactions (account_id, amount, description, ts_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![from.id, -amount, description, ts_ms],
            )?;
            let from_tx = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO transactions (account_id, amount, description, ts_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![to.id, amount, description, ts_ms],
            )?;
            let to_tx = tx.last_insert_rowid();

            tx.execute(
                "UPDATE accounts SET balance = balance - ?2 WHERE id = ?1",
                rusqlite::params![from.id, amount],
            )?;
            tx.execute(
                "UPDATE accounts SET balance = balance + ?2 WHERE id = ?1",
                rusqlite::params![to.id, amount],
            )?;

            tx.execute(
                "INSERT INTO transfers
                     (from_account, to_account, amount, description, from_tx, to_tx, ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![from.id, to.id, amount, description, from_tx, to_tx, ts_ms],
            )?;
            let id = tx.last_insert_rowid();

            tx.commit()?;
            Ok(TransferRecord {
                id,
                from_account: from.id,
                to_account: to.id,
                amount,
                description,
                from_tx,
                to_tx,
                ts_ms: i64_to_u64(ts_ms),
            })
        })
        .await?
    }

    pub async fn account_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<TransactionRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, account_id, amount, description, ts_ms
                 FROM transactions
                 WHERE account_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], |row| {
                Ok(TransactionRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    amount: row.get(2)?,
                    description: row.get(3)?,
                    ts_ms: i64_to_u64(row.get(4)?),
                })
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn append_usage_log(
        &self,
        entry: &UsageLogEntry,
    ) -> Result<i64, SqliteStoreError> {
        let path = self.path.clone();
        let entry = entry.clone();
        let request_json = serde_json::to_string(&entry.request_summary)?;
        let response_json = serde_json::to_string(&entry.response_summary)?;

        tokio::task::spawn_blocking(move || -> Result<i64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_log
                     (permit_id, ts_start_ms, ts_end_ms, ok, latency_ms, caller_ip,
                      request_json, response_json, cost, transaction_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    entry.permit_id,
                    u64_to_i64(entry.ts_start_ms),
                    u64_to_i64(entry.ts_end_ms),
                    entry.ok,
                    u64_to_i64(entry.latency_ms),
                    entry.caller_ip,
                    request_json,
                    response_json,
                    entry.cost,
                    entry.transaction_id,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    /// Counts usage-log rows for a permit with ts_start in [from_ms, until_ms]
    /// and reports the oldest in-window timestamp (drives Retry-After/reset).
    pub async fn usage_window(
        &self,
        permit_id: &str,
        from_ms: u64,
        until_ms: u64,
    ) -> Result<UsageWindow, SqliteStoreError> {
        let path = self.path.clone();
        let permit_id = permit_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<UsageWindow, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let (count, oldest): (i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), MIN(ts_start_ms)
                 FROM usage_log
                 WHERE permit_id = ?1 AND ts_start_ms >= ?2 AND ts_start_ms <= ?3",
                rusqlite::params![permit_id, u64_to_i64(from_ms), u64_to_i64(until_ms)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(UsageWindow {
                count: i64_to_u64(count),
                oldest_ts_ms: oldest.map(i64_to_u64),
            })
        })
        .await?
    }

    pub async fn list_usage_logs(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<UsageLogRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageLogRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let since = since_ts_ms.map(u64_to_i64).unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT id, permit_id, ts_start_ms, ts_end_ms, ok, latency_ms, caller_ip,
                        request_json, response_json, cost, transaction_id
                 FROM usage_log
                 WHERE ts_start_ms >= ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![since, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, Option<i64>>(10)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (
                    id,
                    permit_id,
                    ts_start_ms,
                    ts_end_ms,
                    ok,
                    latency_ms,
                    caller_ip,
                    request_json,
                    response_json,
                    cost,
                    transaction_id,
                ) = row?;
                out.push(UsageLogRecord {
                    id,
                    entry: UsageLogEntry {
                        permit_id,
                        ts_start_ms: i64_to_u64(ts_start_ms),
                        ts_end_ms: i64_to_u64(ts_end_ms),
                        ok,
                        latency_ms: i64_to_u64(latency_ms),
                        caller_ip,
                        request_summary: serde_json::from_str(&request_json)?,
                        response_summary: serde_json::from_str(&response_json)?,
                        cost,
                        transaction_id,
                    },
                });
            }
            Ok(out)
        })
        .await?
    }
}

fn load_account(
    conn: &rusqlite::Connection,
    id: &str,
) -> Result<Option<AccountRecord>, SqliteStoreError> {
    let record = conn
        .query_row(
            "SELECT id, user_id, balance, accepts_input, accepts_output, allow_negative, kind
             FROM accounts WHERE id = ?1",
            rusqlite::params![id],
            account_from_row,
        )
        .optional()?;
    Ok(record)
}

fn load_account_by_user(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Option<AccountRecord>, SqliteStoreError> {
    let record = conn
        .query_row(
            "SELECT id, user_id, balance, accepts_input, accepts_output, allow_negative, kind
             FROM accounts WHERE user_id = ?1",
            rusqlite::params![user_id],
            account_from_row,
        )
        .optional()?;
    Ok(record)
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRecord> {
    Ok(AccountRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        balance: row.get(2)?,
        accepts_input: row.get(3)?,
        accepts_output: row.get(4)?,
        allow_negative: row.get(5)?,
        kind: row.get(6)?,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT UNIQUE,
            balance INTEGER NOT NULL DEFAULT 0,
            accepts_input INTEGER NOT NULL,
            accepts_output INTEGER NOT NULL,
            allow_negative INTEGER NOT NULL,
            kind TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            description TEXT NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_account_id
            ON transactions(account_id);

        CREATE TABLE IF NOT EXISTS transfers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_account TEXT NOT NULL,
            to_account TEXT NOT NULL,
            amount INTEGER NOT NULL,
            description TEXT NOT NULL,
            from_tx INTEGER NOT NULL,
            to_tx INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            permit_id TEXT NOT NULL,
            ts_start_ms INTEGER NOT NULL,
            ts_end_ms INTEGER NOT NULL,
            ok INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            caller_ip TEXT,
            request_json TEXT NOT NULL,
            response_json TEXT NOT NULL,
            cost INTEGER NOT NULL DEFAULT 0,
            transaction_id INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_usage_log_permit_ts
            ON usage_log(permit_id, ts_start_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}
