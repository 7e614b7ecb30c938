//! SQLite state machine for a log-replicated replica.
//!
//! The [`StateMachine`] owns the replica's database file and the sequence
//! ledger stored inside it. Two apply paths exist:
//!
//! - [`StateMachine::apply`] runs a batch directly (the local read path).
//! - [`StateMachine::apply_replicated`] runs a log-sourced batch and records
//!   its sequence number in the same transaction, so the ledger can never
//!   claim progress that was not committed.
//!
//! All SQLite work runs in `spawn_blocking` behind a single connection.
//!
//! Statements that come from a batch run under an authorizer: they may not
//! begin, end or roll back transactions, and they may not touch the ledger
//! table. Both are rejected as apply errors before anything executes.

use common::{DbError, DbResult};
use parser::{BatchKind, ParamStatement, StatementBatch};
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info};
use types::Value;

const LEDGER_TABLE: &str = "_logsql_ledger";

/// Outcome of applying a valid batch.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyResult {
    /// A read returned rows.
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    /// A single write statement ran.
    Write { rows_affected: u64, last_insert_id: i64 },
    /// A bulk batch ran; `last_insert_id` is taken after the final statement.
    Bulk {
        statements: usize,
        rows_affected: u64,
        last_insert_id: i64,
    },
}

/// The replica's database file plus its sequence ledger.
///
/// The connection is opened with exclusive locking, write-ahead logging,
/// `synchronous=NORMAL` and in-memory temp storage: this process is the only
/// one that ever touches the file.
pub struct StateMachine {
    path: Arc<PathBuf>,
    conn: Arc<Mutex<Connection>>,
    scope: BatchScope,
}

/// Marks the window in which statements from a batch are prepared.
#[derive(Clone, Debug, Default)]
struct BatchScope(Arc<AtomicBool>);

impl BatchScope {
    fn enter(&self) -> BatchGuard<'_> {
        self.0.store(true, Ordering::Release);
        BatchGuard(&self.0)
    }

    fn active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Run `f` with the authorizer restricting statements.
    fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enter();
        f()
    }
}

struct BatchGuard<'a>(&'a AtomicBool);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StateMachine {
    /// Open (or create) the database at `path` and make sure the ledger exists.
    ///
    /// A file that cannot be opened or initialized is a fatal storage error.
    pub async fn open(path: &Path) -> DbResult<Self> {
        let path_owned = path.to_path_buf();
        let scope = BatchScope::default();
        let hook_scope = scope.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&path_owned, hook_scope))
            .await
            .map_err(join_error)??;

        debug!(path = %path.display(), "state machine opened");
        Ok(Self {
            path: Arc::new(path.to_path_buf()),
            conn: Arc::new(Mutex::new(conn)),
            scope,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a batch without touching the ledger.
    ///
    /// Validation errors are returned as-is without database access; engine
    /// failures surface as [`DbError::Apply`]. Write batches run inside a
    /// transaction so a failing bulk leaves no partial effects.
    pub async fn apply(&self, batch: &StatementBatch) -> DbResult<ApplyResult> {
        if let Some(err) = batch.validation_error() {
            return Err(err.clone().into());
        }
        let kind = batch.kind.clone();
        let is_read = batch.is_read;
        let scope = self.scope.clone();
        self.with_conn(move |conn| {
            if is_read {
                return scope.run(|| run_kind(conn, &kind, true));
            }
            let tx = conn.transaction().map_err(storage_error)?;
            let result = scope.run(|| run_kind(&tx, &kind, false))?;
            ensure_open(&tx)?;
            tx.commit().map_err(exec_error)?;
            Ok(result)
        })
        .await
    }

    /// Apply a batch read back from the log and advance the ledger to `seq`
    /// in the same transaction.
    ///
    /// On failure nothing is committed, including the ledger; the caller
    /// decides whether to advance past the entry with [`Self::set_sequence`].
    /// Any failure after the batch's statements ran is a [`DbError::Apply`],
    /// so a hostile entry cannot stop replication.
    pub async fn apply_replicated(&self, batch: &StatementBatch, seq: u64) -> DbResult<ApplyResult> {
        if let Some(err) = batch.validation_error() {
            return Err(err.clone().into());
        }
        let kind = batch.kind.clone();
        let is_read = batch.is_read;
        let seq = to_sql_seq(seq)?;
        let scope = self.scope.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_error)?;
            let result = scope.run(|| run_kind(&tx, &kind, is_read))?;
            ensure_open(&tx)?;
            write_ledger(&tx, seq)
                .map_err(|e| DbError::Apply(format!("record sequence {seq}: {e}")))?;
            tx.commit().map_err(exec_error)?;
            Ok(result)
        })
        .await
    }

    /// Last applied log sequence number; `0` for a fresh database.
    pub async fn sequence(&self) -> DbResult<u64> {
        self.with_conn(|conn| read_ledger(conn)).await
    }

    pub async fn set_sequence(&self, seq: u64) -> DbResult<()> {
        let seq = to_sql_seq(seq)?;
        self.with_conn(move |conn| write_ledger(conn, seq).map_err(storage_error))
            .await
    }

    /// Reclaim free pages.
    pub async fn vacuum(&self) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM").map_err(storage_error)?;
            Ok(())
        })
        .await
    }

    /// Fold the write-ahead log back into the main database file.
    pub async fn checkpoint(&self) -> DbResult<()> {
        self.with_conn(|conn| checkpoint(conn)).await
    }

    /// Checkpoint and read the whole database file along with its ledger.
    ///
    /// The connection lock is held for the duration of the read, so the
    /// sequence always describes the returned bytes.
    pub async fn snapshot_bytes(&self) -> DbResult<(u64, Vec<u8>)> {
        let path = self.path.clone();
        self.with_conn(move |conn| {
            checkpoint(conn)?;
            let seq = read_ledger(conn)?;
            Ok((seq, fs::read(path.as_path())?))
        })
        .await
    }

    pub async fn sqlite_version(&self) -> DbResult<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))
                .map_err(storage_error)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> DbResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            f(&mut guard)
        })
        .await
        .map_err(join_error)?
    }
}

fn open_connection(path: &Path, scope: BatchScope) -> DbResult<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)
        .map_err(|e| DbError::Storage(format!("failed to open {}: {e}", path.display())))?;

    let locking: String = conn
        .pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| row.get(0))
        .map_err(storage_error)?;
    let journal: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(storage_error)?;
    debug!(locking, journal, "connection pragmas set");
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(storage_error)?;
    conn.pragma_update(None, "temp_store", "MEMORY")
        .map_err(storage_error)?;

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_applied_seq INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO {LEDGER_TABLE} (id, last_applied_seq) VALUES (1, 0);"
    ))
    .map_err(storage_error)?;

    conn.authorizer(Some(move |ctx: AuthContext<'_>| {
        if scope.active() {
            authorize_batch(&ctx)
        } else {
            Authorization::Allow
        }
    }));

    let seq = read_ledger(&conn)?;
    info!(path = %path.display(), seq, "database ready");
    Ok(conn)
}

/// Deny transaction control and any change to the ledger table.
fn authorize_batch(ctx: &AuthContext<'_>) -> Authorization {
    let denied = match &ctx.action {
        AuthAction::Transaction { .. } | AuthAction::Savepoint { .. } => true,
        AuthAction::Insert { table_name }
        | AuthAction::Delete { table_name }
        | AuthAction::Update { table_name, .. }
        | AuthAction::DropTable { table_name }
        | AuthAction::AlterTable { table_name, .. }
        | AuthAction::CreateIndex { table_name, .. }
        | AuthAction::CreateTrigger { table_name, .. }
        | AuthAction::CreateTempTrigger { table_name, .. } => {
            table_name.eq_ignore_ascii_case(LEDGER_TABLE)
        }
        _ => false,
    };
    if denied {
        debug!(action = ?ctx.action, "statement denied");
        Authorization::Deny
    } else {
        Authorization::Allow
    }
}

/// A batch that ended the enclosing transaction is rejected.
fn ensure_open(conn: &Connection) -> DbResult<()> {
    if conn.is_autocommit() {
        return Err(DbError::Apply("batch ended the enclosing transaction".into()));
    }
    Ok(())
}

fn run_kind(conn: &Connection, kind: &BatchKind, is_read: bool) -> DbResult<ApplyResult> {
    match kind {
        BatchKind::ValidationError(err) => Err(err.clone().into()),
        BatchKind::SimpleQuery { sql } => run_statement(conn, sql, &[], is_read),
        BatchKind::Parameterized(ParamStatement { sql, params }) => {
            run_statement(conn, sql, params, is_read)
        }
        BatchKind::BulkStatements { statements } => {
            let mut rows_affected = 0;
            for sql in statements {
                rows_affected += run_write(conn, sql, &[])?;
            }
            Ok(ApplyResult::Bulk {
                statements: statements.len(),
                rows_affected,
                last_insert_id: conn.last_insert_rowid(),
            })
        }
        BatchKind::BulkParameterized { statements } => {
            let mut rows_affected = 0;
            for stmt in statements {
                rows_affected += run_write(conn, &stmt.sql, &stmt.params)?;
            }
            Ok(ApplyResult::Bulk {
                statements: statements.len(),
                rows_affected,
                last_insert_id: conn.last_insert_rowid(),
            })
        }
    }
}

fn run_statement(conn: &Connection, sql: &str, params: &[Value], is_read: bool) -> DbResult<ApplyResult> {
    if !is_read {
        let rows_affected = run_write(conn, sql, params)?;
        return Ok(ApplyResult::Write {
            rows_affected,
            last_insert_id: conn.last_insert_rowid(),
        });
    }

    let mut stmt = conn.prepare(sql).map_err(exec_error)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt
        .query(params_from_iter(params.iter().map(to_sql)))
        .map_err(exec_error)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(exec_error)? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_sql(row.get_ref(i).map_err(exec_error)?));
        }
        out.push(values);
    }
    Ok(ApplyResult::Rows { columns, rows: out })
}

/// Run a non-read statement and report the rows it changed.
///
/// Statements that yield rows (`RETURNING`, some pragmas) are drained.
fn run_write(conn: &Connection, sql: &str, params: &[Value]) -> DbResult<u64> {
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(rusqlite::Error::MultipleStatement) if params.is_empty() => {
            return run_script(conn, sql);
        }
        Err(e) => return Err(exec_error(e)),
    };
    let bound = params_from_iter(params.iter().map(to_sql));
    if stmt.column_count() == 0 {
        let changed = stmt.execute(bound).map_err(exec_error)?;
        return Ok(changed as u64);
    }
    let mut rows = stmt.query(bound).map_err(exec_error)?;
    while rows.next().map_err(exec_error)?.is_some() {}
    Ok(conn.changes() as u64)
}

/// Run several `;`-separated statements without parameters.
fn run_script(conn: &Connection, sql: &str) -> DbResult<u64> {
    let before = total_changes(conn)?;
    conn.execute_batch(sql).map_err(exec_error)?;
    Ok(total_changes(conn)?.saturating_sub(before))
}

fn total_changes(conn: &Connection) -> DbResult<u64> {
    let changes: i64 = conn
        .query_row("SELECT total_changes()", [], |row| row.get(0))
        .map_err(exec_error)?;
    Ok(changes.max(0) as u64)
}

fn read_ledger(conn: &Connection) -> DbResult<u64> {
    let seq: Option<i64> = conn
        .query_row(
            &format!("SELECT last_applied_seq FROM {LEDGER_TABLE} WHERE id = 1"),
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_error)?;
    let seq = seq.ok_or_else(|| DbError::Storage("ledger row missing".into()))?;
    u64::try_from(seq).map_err(|_| DbError::Storage(format!("negative ledger value {seq}")))
}

fn write_ledger(conn: &Connection, seq: i64) -> rusqlite::Result<()> {
    conn.execute(
        &format!("UPDATE {LEDGER_TABLE} SET last_applied_seq = ?1 WHERE id = 1"),
        params![seq],
    )?;
    Ok(())
}

fn checkpoint(conn: &Connection) -> DbResult<()> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .map_err(storage_error)
}

fn to_sql_seq(seq: u64) -> DbResult<i64> {
    i64::try_from(seq).map_err(|_| DbError::Storage(format!("sequence {seq} out of range")))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Execution failures are apply errors unless the file itself is damaged.
fn exec_error(e: rusqlite::Error) -> DbError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure) => {
            DbError::Storage(e.to_string())
        }
        _ => DbError::Apply(e.to_string()),
    }
}

fn storage_error(e: rusqlite::Error) -> DbError {
    DbError::Storage(e.to_string())
}

fn join_error(e: tokio::task::JoinError) -> DbError {
    DbError::Storage(format!("blocking task failed: {e}"))
}
