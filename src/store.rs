//! Durable single-file store for holders, rounds, locks and bot state
//!
//! One sqlite database in WAL mode behind a process-wide connection. Every
//! entity gets small typed operations; callers never see SQL.

use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

const HEARTBEAT_KEY: &str = "heartbeat_ts";
const SAFE_MODE_KEY: &str = "safe_mode";
const SAFE_MODE_REASON_KEY: &str = "safe_mode_reason";
const RPC_ERRORS_KEY: &str = "consecutive_rpc_errors";

#[derive(Debug)]
pub enum StoreError {
    /// A unique constraint already holds (e.g. lock row exists)
    Conflict,
    /// Row looked up by key does not exist
    NotFound,
    /// The database file cannot be opened
    Corrupt(String),
    /// Any other storage failure
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "store conflict"),
            StoreError::NotFound => write!(f, "row not found"),
            StoreError::Corrupt(msg) => write!(f, "store corrupt: {}", msg),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundType {
    Buy,
    Reward,
}

impl RoundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundType::Buy => "buy",
            RoundType::Reward => "reward",
        }
    }
}

impl fmt::Display for RoundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    BuyJob,
    RewardJob,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::BuyJob => "buy_job",
            LockType::RewardJob => "reward_job",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked wallet and its anti-sybil history
#[derive(Debug, Clone, Default)]
pub struct Holder {
    pub wallet: String,
    pub first_seen_ts: Option<i64>,
    pub last_seen_ts: Option<i64>,
    pub last_balance_raw: u64,
    pub last_balance_check_ts: Option<i64>,
    pub last_decrease_ts: Option<i64>,
    pub continuity_start_ts: Option<i64>,
    pub streak_rounds: u32,
    pub twb_score: f64,
    pub cumulative_buy_sol: f64,
    pub cumulative_buy_sol_low_confidence: f64,
    pub is_blacklisted: bool,
}

/// Partial holder write; `None` fields are preserved on merge
///
/// The two buy fields are accumulators: the provided value is added to the
/// stored total rather than replacing it.
#[derive(Debug, Clone, Default)]
pub struct HolderUpdate {
    pub first_seen_ts: Option<i64>,
    pub last_seen_ts: Option<i64>,
    pub last_balance_raw: Option<u64>,
    pub last_balance_check_ts: Option<i64>,
    pub last_decrease_ts: Option<i64>,
    pub continuity_start_ts: Option<i64>,
    pub streak_rounds: Option<u32>,
    pub twb_score: Option<f64>,
    pub add_buy_sol: Option<f64>,
    pub add_buy_sol_low_confidence: Option<f64>,
    pub is_blacklisted: Option<bool>,
}

/// One completed or attempted job execution
#[derive(Debug, Clone)]
pub struct Round {
    pub id: String,
    pub round_type: RoundType,
    pub ts: i64,
    pub txs: Vec<String>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ScanCursor {
    pub last_processed_signature: String,
    pub last_processed_timestamp: i64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS holders (
    wallet                              TEXT PRIMARY KEY,
    first_seen_ts                       INTEGER,
    last_seen_ts                        INTEGER,
    last_balance_raw                    INTEGER NOT NULL DEFAULT 0,
    last_balance_check_ts               INTEGER,
    last_decrease_ts                    INTEGER,
    continuity_start_ts                 INTEGER,
    streak_rounds                       INTEGER NOT NULL DEFAULT 0,
    twb_score                           REAL NOT NULL DEFAULT 0,
    cumulative_buy_sol                  REAL NOT NULL DEFAULT 0,
    cumulative_buy_sol_low_confidence   REAL NOT NULL DEFAULT 0,
    is_blacklisted                      INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_holders_eligibility
    ON holders (is_blacklisted, cumulative_buy_sol, first_seen_ts,
                continuity_start_ts, last_balance_raw);

CREATE TABLE IF NOT EXISTS rounds (
    id          TEXT PRIMARY KEY,
    round_type  TEXT NOT NULL,
    ts          INTEGER NOT NULL,
    txs         TEXT NOT NULL,
    meta        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rounds_type_ts ON rounds (round_type, ts);

CREATE TABLE IF NOT EXISTS scan_state (
    id                          INTEGER PRIMARY KEY CHECK (id = 1),
    last_processed_signature    TEXT NOT NULL,
    last_processed_timestamp    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_locks (
    lock_type   TEXT PRIMARY KEY,
    acquired_ts INTEGER NOT NULL,
    owner_pid   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bot_state (
    key     TEXT PRIMARY KEY,
    value   TEXT NOT NULL
);
"#;

/// Handle to the embedded database; cheap to clone
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Self::init(conn)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(30_000))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- holders ------------------------------------------------------

    /// Merge-upsert a holder row. `first_seen_ts` is set-once: an existing
    /// non-null value always wins.
    pub fn upsert_holder(&self, wallet: &str, update: &HolderUpdate) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO holders (
                wallet, first_seen_ts, last_seen_ts, last_balance_raw,
                last_balance_check_ts, last_decrease_ts, continuity_start_ts,
                streak_rounds, twb_score,
                cumulative_buy_sol, cumulative_buy_sol_low_confidence, is_blacklisted
            ) VALUES (
                ?1, ?2, ?3, COALESCE(?4, 0),
                ?5, ?6, ?7,
                COALESCE(?8, 0), COALESCE(?9, 0.0),
                COALESCE(?10, 0.0), COALESCE(?11, 0.0), COALESCE(?12, 0)
            )
            ON CONFLICT(wallet) DO UPDATE SET
                first_seen_ts = COALESCE(holders.first_seen_ts, excluded.first_seen_ts),
                last_seen_ts = COALESCE(?3, holders.last_seen_ts),
                last_balance_raw = COALESCE(?4, holders.last_balance_raw),
                last_balance_check_ts = COALESCE(?5, holders.last_balance_check_ts),
                last_decrease_ts = COALESCE(?6, holders.last_decrease_ts),
                continuity_start_ts = COALESCE(?7, holders.continuity_start_ts),
                streak_rounds = COALESCE(?8, holders.streak_rounds),
                twb_score = COALESCE(?9, holders.twb_score),
                cumulative_buy_sol = holders.cumulative_buy_sol + COALESCE(?10, 0.0),
                cumulative_buy_sol_low_confidence =
                    holders.cumulative_buy_sol_low_confidence + COALESCE(?11, 0.0),
                is_blacklisted = COALESCE(?12, holders.is_blacklisted)
            "#,
            params![
                wallet,
                update.first_seen_ts,
                update.last_seen_ts,
                update.last_balance_raw.map(|v| v as i64),
                update.last_balance_check_ts,
                update.last_decrease_ts,
                update.continuity_start_ts,
                update.streak_rounds.map(|v| v as i64),
                update.twb_score,
                update.add_buy_sol,
                update.add_buy_sol_low_confidence,
                update.is_blacklisted.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub fn get_holder(&self, wallet: &str) -> StoreResult<Option<Holder>> {
        let conn = self.lock();
        let holder = conn
            .query_row(
                "SELECT wallet, first_seen_ts, last_seen_ts, last_balance_raw,
                        last_balance_check_ts, last_decrease_ts, continuity_start_ts,
                        streak_rounds, twb_score,
                        cumulative_buy_sol, cumulative_buy_sol_low_confidence, is_blacklisted
                 FROM holders WHERE wallet = ?1",
                [wallet],
                row_to_holder,
            )
            .optional()?;
        Ok(holder)
    }

    pub fn all_wallets(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT wallet FROM holders ORDER BY wallet")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut wallets = Vec::new();
        for wallet in rows {
            wallets.push(wallet?);
        }
        Ok(wallets)
    }

    pub fn holder_count(&self) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM holders", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Reward eligibility as one indexed predicate: not blacklisted, bought
    /// enough, old enough, held long enough, still holding
    pub fn eligible_holders(
        &self,
        now: i64,
        min_age_seconds: i64,
        min_continuity_seconds: i64,
        min_cumulative_buy_sol: f64,
    ) -> StoreResult<Vec<Holder>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT wallet, first_seen_ts, last_seen_ts, last_balance_raw,
                    last_balance_check_ts, last_decrease_ts, continuity_start_ts,
                    streak_rounds, twb_score,
                    cumulative_buy_sol, cumulative_buy_sol_low_confidence, is_blacklisted
             FROM holders
             WHERE is_blacklisted = 0
               AND cumulative_buy_sol >= ?1
               AND first_seen_ts IS NOT NULL AND first_seen_ts <= ?2
               AND continuity_start_ts IS NOT NULL AND continuity_start_ts <= ?3
               AND last_balance_raw > 0
             ORDER BY wallet",
        )?;
        let rows = stmt.query_map(
            params![
                min_cumulative_buy_sol,
                now - min_age_seconds,
                now - min_continuity_seconds
            ],
            row_to_holder,
        )?;
        let mut holders = Vec::new();
        for holder in rows {
            holders.push(holder?);
        }
        Ok(holders)
    }

    /// Post-round accumulator bump for an eligible holder
    pub fn bump_streak_and_twb(&self, wallet: &str, twb_add: f64) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE holders
             SET streak_rounds = streak_rounds + 1, twb_score = twb_score + ?2
             WHERE wallet = ?1",
            params![wallet, twb_add],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_blacklisted(&self, wallet: &str, blacklisted: bool) -> StoreResult<()> {
        self.upsert_holder(
            wallet,
            &HolderUpdate {
                is_blacklisted: Some(blacklisted),
                ..Default::default()
            },
        )
    }

    // ---- rounds -------------------------------------------------------

    /// Rounds are append-only; ids never collide and rows are never updated
    pub fn insert_round(&self, round: &Round) -> StoreResult<()> {
        let txs = serde_json::to_string(&round.txs)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let meta = serde_json::to_string(&round.meta)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO rounds (id, round_type, ts, txs, meta) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![round.id, round.round_type.as_str(), round.ts, txs, meta],
        )?;
        Ok(())
    }

    pub fn latest_round(&self, round_type: RoundType) -> StoreResult<Option<Round>> {
        let conn = self.lock();
        let round = conn
            .query_row(
                "SELECT id, round_type, ts, txs, meta FROM rounds
                 WHERE round_type = ?1 ORDER BY ts DESC, id DESC LIMIT 1",
                [round_type.as_str()],
                row_to_round,
            )
            .optional()?;
        Ok(round)
    }

    // ---- scan cursor --------------------------------------------------

    pub fn scan_cursor(&self) -> StoreResult<Option<ScanCursor>> {
        let conn = self.lock();
        let cursor = conn
            .query_row(
                "SELECT last_processed_signature, last_processed_timestamp
                 FROM scan_state WHERE id = 1",
                [],
                |row| {
                    Ok(ScanCursor {
                        last_processed_signature: row.get(0)?,
                        last_processed_timestamp: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    /// Advance the cursor to the newest signature seen in a batch
    pub fn set_scan_cursor(&self, signature: &str, timestamp: i64) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO scan_state (id, last_processed_signature, last_processed_timestamp)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                last_processed_signature = excluded.last_processed_signature,
                last_processed_timestamp = excluded.last_processed_timestamp",
            params![signature, timestamp],
        )?;
        Ok(())
    }

    // ---- execution locks ----------------------------------------------

    /// Insert-as-acquire. Uniqueness on `lock_type` makes acquisition atomic;
    /// a held lock comes back as `Ok(false)`, transport errors as `Err`.
    pub fn acquire_lock(&self, lock_type: LockType, now: i64, owner_pid: u32) -> StoreResult<bool> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO execution_locks (lock_type, acquired_ts, owner_pid) VALUES (?1, ?2, ?3)",
            params![lock_type.as_str(), now, owner_pid],
        );
        match result.map_err(StoreError::from) {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete-by-key; safe to call whether or not the lock is held
    pub fn release_lock(&self, lock_type: LockType) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM execution_locks WHERE lock_type = ?1",
            [lock_type.as_str()],
        )?;
        Ok(())
    }

    pub fn lock_held(&self, lock_type: LockType) -> StoreResult<bool> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT 1 FROM execution_locks WHERE lock_type = ?1")?;
        Ok(stmt.exists([lock_type.as_str()])?)
    }

    /// Startup cleanup of locks left behind by a dead process
    pub fn clear_stale_locks(&self, max_age_seconds: i64, now: i64) -> StoreResult<usize> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM execution_locks WHERE acquired_ts < ?1",
            [now - max_age_seconds],
        )?;
        Ok(removed)
    }

    // ---- bot state ----------------------------------------------------

    fn set_state(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO bot_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.lock();
        let value = conn
            .query_row("SELECT value FROM bot_state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn delete_state(&self, key: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM bot_state WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn set_heartbeat(&self, ts: i64) -> StoreResult<()> {
        self.set_state(HEARTBEAT_KEY, &ts.to_string())
    }

    pub fn heartbeat(&self) -> StoreResult<Option<i64>> {
        Ok(self.get_state(HEARTBEAT_KEY)?.and_then(|v| v.parse().ok()))
    }

    /// Latch safe-mode; entering twice is idempotent
    pub fn enter_safe_mode(&self, reason: &str) -> StoreResult<()> {
        self.set_state(SAFE_MODE_KEY, "1")?;
        self.set_state(SAFE_MODE_REASON_KEY, reason)
    }

    pub fn is_safe_mode(&self) -> StoreResult<bool> {
        Ok(self.get_state(SAFE_MODE_KEY)?.is_some())
    }

    pub fn safe_mode_reason(&self) -> StoreResult<Option<String>> {
        self.get_state(SAFE_MODE_REASON_KEY)
    }

    /// The only operator-mediated write path: clears the latch
    pub fn exit_safe_mode(&self) -> StoreResult<()> {
        self.delete_state(SAFE_MODE_KEY)?;
        self.delete_state(SAFE_MODE_REASON_KEY)
    }

    pub fn rpc_error_count(&self) -> StoreResult<u32> {
        Ok(self
            .get_state(RPC_ERRORS_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub fn set_rpc_error_count(&self, count: u32) -> StoreResult<()> {
        self.set_state(RPC_ERRORS_KEY, &count.to_string())
    }
}

fn row_to_holder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Holder> {
    Ok(Holder {
        wallet: row.get(0)?,
        first_seen_ts: row.get(1)?,
        last_seen_ts: row.get(2)?,
        last_balance_raw: row.get::<_, i64>(3)? as u64,
        last_balance_check_ts: row.get(4)?,
        last_decrease_ts: row.get(5)?,
        continuity_start_ts: row.get(6)?,
        streak_rounds: row.get::<_, i64>(7)? as u32,
        twb_score: row.get(8)?,
        cumulative_buy_sol: row.get(9)?,
        cumulative_buy_sol_low_confidence: row.get(10)?,
        is_blacklisted: row.get::<_, i64>(11)? != 0,
    })
}

fn row_to_round(row: &rusqlite::Row<'_>) -> rusqlite::Result<Round> {
    let round_type: String = row.get(1)?;
    let txs: String = row.get(3)?;
    let meta: String = row.get(4)?;
    Ok(Round {
        id: row.get(0)?,
        round_type: if round_type == "reward" {
            RoundType::Reward
        } else {
            RoundType::Buy
        },
        ts: row.get(2)?,
        txs: serde_json::from_str(&txs).unwrap_or_default(),
        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
    })
}
