//! Ledger writer thread.
//!
//! A single OS thread owns the SQLite connection. Callers enqueue boxed
//! closures on a bounded queue and either forget them (present marks) or
//! wait for the reply (reconciliation, queries). Commands run in FIFO
//! order, so a reconciliation always sees every mark submitted before it.

use crate::ledger::{self, PresentMark, ReconcileBatch, ReconcileReport};
use crate::{identities, Store, StoreError};
use rollcall_core::{CatalogError, Identity, IdentitySource};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger write failed after {attempts} attempts: {reason}")]
    WriteFailed { attempts: u32, reason: String },
    #[error("ledger writer is not running")]
    Closed,
    #[error("failed to spawn ledger writer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Pending commands before submitters block.
    pub queue_capacity: usize,
    /// Extra attempts after a failed write.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub retry_backoff: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

type LedgerTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum LedgerCommand {
    Execute(LedgerTask),
    Shutdown,
}

struct LedgerInner {
    sender: mpsc::SyncSender<LedgerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failed_writes: Arc<AtomicU64>,
    options: WriterOptions,
}

impl Drop for LedgerInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if self.sender.send(LedgerCommand::Shutdown).is_err() {
                tracing::error!("ledger writer already gone at shutdown");
            }
            if let Err(err) = handle.join() {
                tracing::error!(error = ?err, "ledger writer panicked");
            }
        }
    }
}

/// Clone-safe handle to the ledger writer thread.
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Arc<LedgerInner>,
}

/// Move the store's connection onto a dedicated writer thread.
pub fn spawn_writer(store: Store, options: WriterOptions) -> Result<LedgerHandle, LedgerError> {
    let (tx, rx) = mpsc::sync_channel::<LedgerCommand>(options.queue_capacity.max(1));
    let mut conn = store.into_connection();

    let worker = std::thread::Builder::new()
        .name("rollcall-ledger".into())
        .spawn(move || {
            tracing::info!("ledger writer started");
            while let Ok(command) = rx.recv() {
                match command {
                    LedgerCommand::Execute(task) => task(&mut conn),
                    LedgerCommand::Shutdown => break,
                }
            }
            tracing::info!("ledger writer exiting");
        })
        .map_err(LedgerError::Spawn)?;

    Ok(LedgerHandle {
        inner: Arc::new(LedgerInner {
            sender: tx,
            worker: Mutex::new(Some(worker)),
            failed_writes: Arc::new(AtomicU64::new(0)),
            options,
        }),
    })
}

/// Run `op` until it succeeds or the retry budget is spent.
fn with_retries<T>(
    conn: &mut Connection,
    options: WriterOptions,
    what: &str,
    mut op: impl FnMut(&mut Connection) -> Result<T, StoreError>,
) -> Result<T, LedgerError> {
    let attempts = options.retries.saturating_add(1);
    let mut backoff = options.retry_backoff;
    let mut attempt = 1;
    loop {
        match op(conn) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::warn!(what, attempt, error = %err, "ledger write failed; retrying");
                std::thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => {
                return Err(LedgerError::WriteFailed {
                    attempts,
                    reason: err.to_string(),
                })
            }
        }
    }
}

impl LedgerHandle {
    fn enqueue(&self, task: LedgerTask) -> Result<(), LedgerError> {
        self.inner
            .sender
            .send(LedgerCommand::Execute(task))
            .map_err(|_| LedgerError::Closed)
    }

    /// Queue a present mark. Blocks while the queue is full; never drops.
    ///
    /// Failures after the retry budget are logged and counted, not returned.
    pub fn submit_present(&self, mark: PresentMark) -> Result<(), LedgerError> {
        let options = self.inner.options;
        let failed = Arc::clone(&self.inner.failed_writes);
        self.enqueue(Box::new(move |conn| {
            let written =
                with_retries(conn, options, "present", |conn| ledger::upsert_present(conn, &mark));
            match written {
                Ok(outcome) => tracing::debug!(
                    identity = %mark.key.identity_id,
                    sequence = mark.sequence,
                    ?outcome,
                    "present mark written"
                ),
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        identity = %mark.key.identity_id,
                        class = %mark.key.class_id,
                        error = %err,
                        "present mark lost"
                    );
                }
            }
        }))
    }

    /// Apply a reconciliation batch behind every mark already queued.
    pub fn reconcile(&self, batch: ReconcileBatch) -> Result<ReconcileReport, LedgerError> {
        let options = self.inner.options;
        self.call_raw(move |conn| {
            with_retries(conn, options, "reconcile", |conn| ledger::reconcile(conn, &batch))
        })
    }

    /// Run a query on the writer thread and wait for its result.
    pub fn call<F, T>(&self, task: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.call_raw(move |conn| task(conn).map_err(LedgerError::from))
    }

    fn call_raw<F, T>(&self, task: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.enqueue(Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                tracing::warn!("ledger caller dropped before receiving result");
            }
        }))?;
        reply_rx.recv().map_err(|_| LedgerError::Closed)?
    }

    /// Async variant of [`LedgerHandle::call`].
    pub async fn call_async<F, T>(&self, task: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = LedgerCommand::Execute(Box::new(move |conn| {
            if reply_tx.send(task(conn).map_err(LedgerError::from)).is_err() {
                tracing::warn!("ledger caller dropped before receiving result");
            }
        }));
        // A full queue would block the runtime thread; hand the send off.
        let sender = self.inner.sender.clone();
        tokio::task::spawn_blocking(move || sender.send(command))
            .await
            .map_err(|_| LedgerError::Closed)?
            .map_err(|_| LedgerError::Closed)?;
        reply_rx.await.map_err(|_| LedgerError::Closed)?
    }

    /// Present marks dropped after exhausting retries.
    pub fn failed_writes(&self) -> u64 {
        self.inner.failed_writes.load(Ordering::Relaxed)
    }
}

impl IdentitySource for LedgerHandle {
    fn load_identities(&self) -> Result<Vec<Identity>, CatalogError> {
        self.call(|conn| identities::load_identities(conn))
            .map_err(|e| CatalogError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AbsentMark, AttendanceKey, AttendanceStatus};
    use chrono::{Local, NaiveDate};

    fn options() -> WriterOptions {
        WriterOptions {
            queue_capacity: 4,
            retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn key(id: &str) -> AttendanceKey {
        AttendanceKey {
            identity_id: id.into(),
            class_id: "MATH110".into(),
            date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        }
    }

    fn mark(id: &str, sequence: u64) -> PresentMark {
        PresentMark {
            key: key(id),
            at: Local::now(),
            operator_id: "prof-7".into(),
            session_id: "s".into(),
            sequence,
        }
    }

    #[test]
    fn test_marks_applied_before_reconcile() {
        let handle = spawn_writer(Store::open_in_memory().unwrap(), options()).unwrap();
        // More marks than the queue holds: submitters block instead of dropping.
        for seq in 0..20 {
            handle.submit_present(mark("S1", seq)).unwrap();
        }

        let report = handle
            .reconcile(ReconcileBatch {
                session_id: "s".into(),
                stopped_at: Local::now(),
                present: vec![],
                absent: vec![AbsentMark {
                    key: key("S2"),
                    operator_id: "prof-7".into(),
                    session_id: "s".into(),
                }],
            })
            .unwrap();
        assert_eq!(report.absent_inserted, 1);

        let s1 = handle.call(|conn| ledger::record(conn, &key("S1"))).unwrap().unwrap();
        assert_eq!(s1.status, AttendanceStatus::Present);
        assert_eq!(s1.last_sequence, 19);
        assert_eq!(handle.failed_writes(), 0);
    }

    #[test]
    fn test_failed_present_counted_after_retries() {
        let store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_all BEFORE INSERT ON attendance
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let handle = spawn_writer(store, options()).unwrap();

        handle.submit_present(mark("S1", 1)).unwrap();
        // Round-trip a query so the mark has been processed.
        handle.call(|_| Ok(())).unwrap();
        assert_eq!(handle.failed_writes(), 1);
    }

    #[test]
    fn test_reconcile_failure_reports_attempts() {
        let store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_all BEFORE INSERT ON attendance
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let handle = spawn_writer(store, options()).unwrap();

        let err = handle
            .reconcile(ReconcileBatch {
                session_id: "s".into(),
                stopped_at: Local::now(),
                present: vec![mark("S1", 1)],
                absent: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::WriteFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_call_async_and_identity_source() {
        let handle = spawn_writer(Store::open_in_memory().unwrap(), options()).unwrap();
        let count: i64 = handle
            .call_async(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);

        let loader = handle.clone();
        let identities = tokio::task::spawn_blocking(move || loader.load_identities())
            .await
            .unwrap()
            .unwrap();
        assert!(identities.is_empty());
    }
}
