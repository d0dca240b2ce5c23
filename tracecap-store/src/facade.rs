//! The transactional store façade: a thin wrapper over a single SQLite
//! connection exposing record-level read/write/query plus bulk
//! transaction scoping.
//!
//! One method per operation, engine errors mapped through a single
//! `internal_error` helper, reentrant and retry-on-busy over a single
//! connection: the façade itself *is* the lock, implemented with a
//! `parking_lot::ReentrantMutex` so nested `safe_transaction` calls on
//! the same thread join the outer transaction instead of deadlocking.

use crate::query::Query;
use crate::task::{AsyncTaskQueue, Task};
use crate::value::Value;
use parking_lot::ReentrantMutex;
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracecap_error::{Error, Result};
use tracecap_schema::{materialize, Schema};

/// How long `safe_transaction` sleeps between retries when the engine
/// reports `SQLITE_BUSY`/`SQLITE_LOCKED`.
const BUSY_RETRY_BACKOFF: Duration = Duration::from_millis(25);

struct Inner {
    conn: Connection,
    /// Reentrancy depth: 0 means no `safe_transaction` is currently
    /// active on this thread; >0 means we are nested inside one.
    depth: u32,
}

/// A handle identifying one inserted row: the table it lives in and its
/// SQLite `rowid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub table: String,
    pub id: i64,
}

pub struct StoreFacade {
    inner: ReentrantMutex<RefCell<Inner>>,
    /// True once the store has committed at least one transaction.
    /// `apply_schema` is only permitted before this flips, and only on a
    /// store that was newly created at `open()` time.
    committed: AtomicBool,
    is_new: bool,
    path: PathBuf,
    /// The store's only out-of-band writer: metadata and `StringMap`
    /// deltas that don't belong on the hot `safe_transaction` path the
    /// frame pipeline drives directly. `StoreFacade` exclusively owns
    /// both the engine handle and this queue; callers reach it only
    /// through `enqueue_task`/`stop_task_queue`.
    task_queue: AsyncTaskQueue,
}

/// Passed to the closure given to [`StoreFacade::safe_transaction`]. Every
/// SQL statement the closure wants to run goes through this context so the
/// façade can detect busy/locked signals and drive the outer retry loop.
pub struct TxContext<'c> {
    conn: &'c Connection,
    retry: &'c Cell<bool>,
}

impl<'c> TxContext<'c> {
    /// Escape hatch for callers (e.g. schema materialization) that need
    /// to run arbitrary statements against the raw connection.
    pub fn conn(&self) -> &Connection {
        self.conn
    }

    fn wrap<T>(&self, sql: &str, result: rusqlite::Result<T>) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) if is_busy(&e) => {
                self.retry.set(true);
                Err(Error::engine(sql, "database busy, retrying"))
            }
            Err(e) => Err(Error::engine(sql, e.to_string())),
        }
    }

    pub fn insert(&self, table: &str, cols: &[&str], values: &[Value]) -> Result<RecordHandle> {
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            cols.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        let outcome = self.conn.execute(&sql, params.as_slice());
        self.wrap(&sql, outcome)?;
        Ok(RecordHandle {
            table: table.to_string(),
            id: self.conn.last_insert_rowid(),
        })
    }

    pub fn get_record(&self, table: &str, cols: &[&str], id: i64) -> Result<Option<Vec<Value>>> {
        self.find_record(table, cols, "rowid", &Value::I64(id))
    }

    pub fn find_record(
        &self,
        table: &str,
        cols: &[&str],
        where_col: &str,
        where_val: &Value,
    ) -> Result<Option<Vec<Value>>> {
        let sql = format!(
            "SELECT {} FROM {table} WHERE {where_col} = ?1",
            cols.join(", ")
        );
        let outcome = self.conn.query_row(&sql, [where_val], |row| {
            (0..cols.len()).map(|i| row.get(i)).collect()
        });
        match outcome {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                if is_busy(&e) {
                    self.retry.set(true);
                }
                Err(Error::engine(sql, e.to_string()))
            }
        }
    }

    pub fn update_scalar(&self, handle: &RecordHandle, col: &str, value: Value) -> Result<()> {
        let sql = format!("UPDATE {} SET {col} = ?1 WHERE rowid = ?2", handle.table);
        let outcome = self
            .conn
            .execute(&sql, rusqlite::params![value, handle.id]);
        self.wrap(&sql, outcome)?;
        Ok(())
    }

    pub fn query<'q>(&'q self, table: &str) -> Query<'q> {
        Query::new(self, table)
    }

    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize> {
        let outcome = self.conn.execute(sql, []);
        self.wrap(sql, outcome)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(ffi_err, _)
            if matches!(
                ffi_err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

impl StoreFacade {
    /// Open (or create) a store at `path`. If `force_new` and a file
    /// already exists there, it is truncated first. Returns an `Arc`
    /// because the façade's own task queue holds a `Weak` back reference
    /// to it, so the handle is never constructed outside of one.
    pub fn open(path: impl AsRef<Path>, force_new: bool) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        if force_new && existed {
            std::fs::remove_file(&path)
                .map_err(|e| Error::configuration(format!("failed to truncate {path:?}: {e}")))?;
        }
        let is_new = force_new || !existed;

        let conn = Connection::open(&path)
            .map_err(|e| Error::configuration(format!("failed to open {path:?}: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::engine("PRAGMA setup", e.to_string()))?;
        register_fuzzy_match(&conn)?;

        Ok(Arc::new_cyclic(|weak| Self {
            inner: ReentrantMutex::new(RefCell::new(Inner { conn, depth: 0 })),
            committed: AtomicBool::new(false),
            is_new,
            path,
            task_queue: AsyncTaskQueue::new(weak.clone()),
        }))
    }

    /// Open an in-memory store, used by tests that don't need a real file.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::configuration(format!("failed to open in-memory store: {e}")))?;
        register_fuzzy_match(&conn)?;
        Ok(Arc::new_cyclic(|weak| Self {
            inner: ReentrantMutex::new(RefCell::new(Inner { conn, depth: 0 })),
            committed: AtomicBool::new(false),
            is_new: true,
            path: PathBuf::new(),
            task_queue: AsyncTaskQueue::new(weak.clone()),
        }))
    }

    /// Enqueue one unit of out-of-band work (metadata writes, `StringMap`
    /// deltas) onto the façade's background task queue.
    pub fn enqueue_task(&self, task: Box<dyn Task>) {
        self.task_queue.enqueue(task);
    }

    /// Drain and stop the background task queue, joining its consumer
    /// thread. Fails with [`Error::Shutdown`] if called from within a
    /// `Task::execute()` running on that same consumer thread.
    pub fn stop_task_queue(&self) -> Result<()> {
        self.task_queue.stop()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if this handle was opened against a freshly created (or
    /// truncated) file. Callers use this to decide whether `apply_schema`
    /// should run at all on this open, rather than relying on it failing.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Materialize `schema`'s DDL. Only permitted before the first commit
    /// of a newly created file; fails with [`Error::Configuration`]
    /// otherwise.
    pub fn apply_schema(&self, schema: &Schema) -> Result<()> {
        if !self.is_new || self.committed.load(Ordering::SeqCst) {
            return Err(Error::configuration(
                "apply_schema is only permitted before the first commit of a newly created store",
            ));
        }
        let statements = materialize(schema);
        self.safe_transaction(|tx| {
            for stmt in &statements {
                tx.conn()
                    .execute_batch(stmt)
                    .map_err(|e| Error::engine(stmt.clone(), e.to_string()))?;
            }
            Ok(())
        })
    }

    /// Execute `f` inside `BEGIN`/`COMMIT`. Reentrant: a nested call from
    /// within `f` joins the outer transaction rather than issuing a
    /// second `BEGIN`. On `SQLITE_BUSY`/`SQLITE_LOCKED` the whole
    /// transaction is retried after a 25 ms sleep; every other engine
    /// error propagates to the caller.
    pub fn safe_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&TxContext<'_>) -> Result<T>,
    {
        loop {
            let guard = self.inner.lock();

            {
                let mut inner = guard.borrow_mut();
                if inner.depth == 0 {
                    if let Err(e) = inner.conn.execute_batch("BEGIN IMMEDIATE") {
                        if is_busy(&e) {
                            drop(inner);
                            drop(guard);
                            thread::sleep(BUSY_RETRY_BACKOFF);
                            continue;
                        }
                        return Err(Error::engine("BEGIN IMMEDIATE", e.to_string()));
                    }
                }
                inner.depth += 1;
            }

            let retry = Cell::new(false);
            let body_result = {
                let inner = guard.borrow();
                let ctx = TxContext {
                    conn: &inner.conn,
                    retry: &retry,
                };
                f(&ctx)
            };

            let mut inner = guard.borrow_mut();
            inner.depth -= 1;
            let is_outer = inner.depth == 0;

            if retry.get() {
                if is_outer {
                    let _ = inner.conn.execute_batch("ROLLBACK");
                }
                drop(inner);
                drop(guard);
                thread::sleep(BUSY_RETRY_BACKOFF);
                continue;
            }

            match body_result {
                Ok(value) => {
                    if !is_outer {
                        return Ok(value);
                    }
                    match inner.conn.execute_batch("COMMIT") {
                        Ok(()) => {
                            self.committed.store(true, Ordering::SeqCst);
                            return Ok(value);
                        }
                        Err(e) if is_busy(&e) => {
                            drop(inner);
                            drop(guard);
                            thread::sleep(BUSY_RETRY_BACKOFF);
                            continue;
                        }
                        Err(e) => return Err(Error::engine("COMMIT", e.to_string())),
                    }
                }
                Err(e) => {
                    if is_outer {
                        let _ = inner.conn.execute_batch("ROLLBACK");
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Registers the `fuzzyMatch(col, target, code)` SQL function used by
/// [`Query::filter_fuzzy`] for epsilon-tolerant floating point
/// comparisons. `code` is a [`crate::query::Constraint`]'s discriminant.
fn register_fuzzy_match(conn: &Connection) -> Result<()> {
    use crate::query::Constraint;
    use rusqlite::functions::FunctionFlags;

    conn.create_scalar_function(
        "fuzzyMatch",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let value: f64 = ctx.get(0)?;
            let target: f64 = ctx.get(1)?;
            let code: i32 = ctx.get(2)?;
            let constraint = Constraint::from_code(code).unwrap_or(Constraint::Equal);
            Ok(if fuzzy_matches(value, target, constraint) {
                1
            } else {
                0
            })
        },
    )
    .map_err(|e| Error::engine("create_scalar_function(fuzzyMatch)", e.to_string()))
}

/// Epsilon-tolerant comparison: two values are "equal" if their absolute
/// difference is within `EPSILON` times the larger magnitude. Ordering
/// comparators fall back to exact ordering once the epsilon-equal case
/// is ruled out.
fn fuzzy_matches(value: f64, target: f64, constraint: crate::query::Constraint) -> bool {
    use crate::query::Constraint::*;
    const EPSILON: f64 = f64::EPSILON * 8.0;
    let approx_equal = {
        let diff = (value - target).abs();
        let scale = value.abs().max(target.abs());
        diff <= scale * EPSILON
    };
    match constraint {
        Equal => approx_equal,
        NotEqual => !approx_equal,
        Less => value < target && !approx_equal,
        LessEqual => value < target || approx_equal,
        Greater => value > target && !approx_equal,
        GreaterEqual => value > target || approx_equal,
    }
}
