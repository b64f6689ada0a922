//! Owns the running sessions, keyed by class.

use crate::capture::{CaptureOutcome, CaptureWorker};
use crate::session::{Session, SessionError, SessionInfo, SessionPhase, StopReport};
use crate::snapshot::{self, Snapshot, SnapshotReceiver};
use chrono::Local;
use rollcall_core::{
    CatalogHandle, CatalogOptions, EmbeddingCatalog, FaceProvider, ProviderError, SidecarProvider,
};
use rollcall_hw::SourceOpener;
use rollcall_store::{identities, ledger, roster, LedgerHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Creates one face provider per session.
pub trait ProviderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceProvider>, ProviderError>;
}

pub struct SidecarFactory {
    pub command: Vec<String>,
}

impl ProviderFactory for SidecarFactory {
    fn create(&self) -> Result<Box<dyn FaceProvider>, ProviderError> {
        Ok(Box::new(SidecarProvider::spawn(&self.command)?))
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub device: String,
    pub tolerance: f32,
    pub catalog: CatalogOptions,
    pub stop_timeout: Duration,
    pub max_consecutive_failures: u32,
    /// JPEG quality for snapshot previews; `None` disables them.
    pub preview_quality: Option<u8>,
}

struct ActiveSession {
    session: Arc<Session>,
    cancel: CancellationToken,
    snapshots: SnapshotReceiver,
    done: Option<oneshot::Receiver<CaptureOutcome>>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub phase: SessionPhase,
    pub roster: usize,
    pub recognized: usize,
    pub accuracy: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub version: &'static str,
    pub device: String,
    pub sessions: Vec<SessionSummary>,
    pub catalog_identities: usize,
    pub catalog_references: usize,
    pub failed_writes: u64,
}

pub struct SessionManager {
    options: ManagerOptions,
    ledger: LedgerHandle,
    catalog: CatalogHandle,
    opener: Arc<dyn SourceOpener>,
    providers: Arc<dyn ProviderFactory>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
    /// Identity revision the current catalog was built from.
    catalog_revision: Mutex<Option<String>>,
}

async fn blocking<T, F>(f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SessionError::WorkerSpawn(e.to_string()))?
}

impl SessionManager {
    pub fn new(
        options: ManagerOptions,
        ledger: LedgerHandle,
        catalog: CatalogHandle,
        opener: Arc<dyn SourceOpener>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            options,
            ledger,
            catalog,
            opener,
            providers,
            sessions: Mutex::new(HashMap::new()),
            catalog_revision: Mutex::new(None),
        }
    }

    /// Rebuild the catalog from storage and swap it in.
    pub async fn reload_catalog(&self) -> Result<usize, SessionError> {
        let ledger = self.ledger.clone();
        let options = self.options.catalog;
        let (catalog, revision) = blocking(move || {
            let revision = ledger.call(|conn| identities::catalog_revision(conn))?;
            Ok((EmbeddingCatalog::load(&ledger, options)?, revision))
        })
        .await?;
        let count = catalog.len();
        self.catalog.replace(catalog);
        *self.catalog_revision.lock().await = Some(revision);
        Ok(count)
    }

    /// Reload only when enrollments changed since the last load. Returns
    /// whether a reload happened.
    pub async fn refresh_catalog(&self) -> Result<bool, SessionError> {
        let current = self
            .ledger
            .call_async(|conn| identities::catalog_revision(conn))
            .await?;
        if self.catalog_revision.lock().await.as_deref() == Some(current.as_str()) {
            return Ok(false);
        }
        self.reload_catalog().await?;
        Ok(true)
    }

    /// Open the camera, start a session for `class_id` and its capture worker.
    pub async fn start_session(
        &self,
        class_id: &str,
        operator_id: &str,
    ) -> Result<SessionInfo, SessionError> {
        let mut sessions = self.sessions.lock().await;
        reap_closed(&mut sessions).await;

        if sessions.contains_key(class_id) {
            return Err(SessionError::SessionAlreadyActive {
                class_id: class_id.to_string(),
            });
        }
        if let Some(active) = sessions
            .values()
            .find(|a| a.session.info().device == self.options.device)
        {
            return Err(SessionError::DeviceInUse {
                device: self.options.device.clone(),
                class_id: active.session.info().class_id.clone(),
            });
        }

        self.refresh_catalog().await?;

        let opener = Arc::clone(&self.opener);
        let device = self.options.device.clone();
        let source = blocking(move || {
            opener
                .open(&device)
                .map_err(|e| SessionError::SourceUnavailable(e.to_string()))
        })
        .await?;

        let providers = Arc::clone(&self.providers);
        let provider = blocking(move || {
            providers
                .create()
                .map_err(|e| SessionError::ProviderUnavailable(e.to_string()))
        })
        .await?;

        let class = class_id.to_string();
        let (roster, totals) = self
            .ledger
            .call_async(move |conn| {
                Ok((roster::roster_for(conn, &class)?, ledger::absence_totals(conn, &class)?))
            })
            .await?;
        if roster.is_empty() {
            tracing::warn!(class = class_id, "roster is empty; everyone seen will be ignored");
        }

        let now = Local::now();
        let info = SessionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            class_id: class_id.to_string(),
            operator_id: operator_id.to_string(),
            date: now.date_naive(),
            started_at: now,
            device: self.options.device.clone(),
        };
        let session = Arc::new(Session::new(info.clone(), roster, totals, self.ledger.clone()));
        let starting = Arc::clone(&session);
        blocking(move || starting.start()).await?;

        let (snap_tx, snap_rx) = snapshot::channel();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let worker = CaptureWorker {
            session: Arc::clone(&session),
            source,
            provider,
            catalog: self.catalog.clone(),
            tolerance: self.options.tolerance,
            max_consecutive_failures: self.options.max_consecutive_failures,
            preview_quality: self.options.preview_quality,
            snapshots: snap_tx,
            cancel: cancel.clone(),
        };
        let handle = match worker.spawn(done_tx) {
            Ok(handle) => handle,
            Err(err) => {
                let closing = Arc::clone(&session);
                if let Err(close_err) = blocking(move || closing.abandon(Local::now())).await {
                    tracing::error!(
                        error = %close_err,
                        "failed to close session after spawn failure"
                    );
                }
                return Err(SessionError::WorkerSpawn(err.to_string()));
            }
        };

        sessions.insert(
            class_id.to_string(),
            ActiveSession {
                session,
                cancel,
                snapshots: snap_rx,
                done: Some(done_rx),
                worker: Some(handle),
            },
        );
        Ok(info)
    }

    /// Cancel the worker, wait for it to reconcile, and return the report.
    pub async fn stop_session(&self, class_id: &str) -> Result<StopReport, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let active = sessions
            .get_mut(class_id)
            .ok_or_else(|| SessionError::NoActiveSession {
                class_id: class_id.to_string(),
            })?;

        active.cancel.cancel();

        let outcome = match active.done.as_mut() {
            Some(done) => match tokio::time::timeout(self.options.stop_timeout, done).await {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(_)) => None,
                Err(_) => {
                    tracing::warn!(class = class_id, "capture worker did not stop in time");
                    return Err(SessionError::StopTimedOut {
                        class_id: class_id.to_string(),
                        timeout_ms: self.options.stop_timeout.as_millis() as u64,
                    });
                }
            },
            None => None,
        };
        active.done = None;
        if let Some(handle) = active.worker.take() {
            join_worker(class_id, handle).await;
        }

        let result = match outcome {
            Some(outcome) => {
                tracing::info!(
                    class = class_id,
                    exit = ?outcome.exit,
                    frames = outcome.frames,
                    "capture worker stopped"
                );
                outcome.stop
            }
            None => {
                // Worker already reported, or vanished; retry the stop here.
                let session = Arc::clone(&active.session);
                blocking(move || session.stop(Local::now())).await
            }
        };

        match result {
            Ok(report) => {
                sessions.remove(class_id);
                Ok(report)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn status(&self) -> ManagerStatus {
        let sessions = self.sessions.lock().await;
        let catalog = self.catalog.current();
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|a| SessionSummary {
                info: a.session.info().clone(),
                phase: a.session.phase(),
                roster: a.session.roster().len(),
                recognized: a.session.recognized().len(),
                accuracy: a.session.accuracy(),
            })
            .collect();
        summaries.sort_by(|a, b| a.info.class_id.cmp(&b.info.class_id));

        ManagerStatus {
            version: env!("CARGO_PKG_VERSION"),
            device: self.options.device.clone(),
            sessions: summaries,
            catalog_identities: catalog.len(),
            catalog_references: catalog.reference_count(),
            failed_writes: self.ledger.failed_writes(),
        }
    }

    /// Latest snapshot published by the class's worker, if any yet.
    pub async fn snapshot(&self, class_id: &str) -> Result<Option<Arc<Snapshot>>, SessionError> {
        let rx = self.subscribe(class_id).await?;
        let latest = rx.borrow().clone();
        Ok(latest)
    }

    pub async fn subscribe(&self, class_id: &str) -> Result<SnapshotReceiver, SessionError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(class_id)
            .map(|a| a.snapshots.clone())
            .ok_or_else(|| SessionError::NoActiveSession {
                class_id: class_id.to_string(),
            })
    }

    /// Stop every session, for daemon shutdown.
    pub async fn shutdown(&self) {
        let classes: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for class_id in classes {
            match self.stop_session(&class_id).await {
                Ok(report) => tracing::info!(
                    class = %class_id,
                    absent = report.absent.len(),
                    "session reconciled at shutdown"
                ),
                Err(err) => {
                    tracing::error!(
                        class = %class_id,
                        error = %err,
                        "session left open at shutdown"
                    )
                }
            }
        }
    }
}

async fn join_worker(class_id: &str, handle: JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::error!(class = class_id, "capture thread panicked"),
        Err(err) => {
            tracing::error!(class = class_id, error = %err, "failed to join capture thread")
        }
    }
}

/// Drop sessions whose worker ended on its own and reconciled.
async fn reap_closed(sessions: &mut HashMap<String, ActiveSession>) {
    let closed: Vec<String> = sessions
        .iter()
        .filter(|(_, active)| active.session.phase() == SessionPhase::Closed)
        .map(|(class_id, _)| class_id.clone())
        .collect();
    for class_id in closed {
        if let Some(mut active) = sessions.remove(&class_id) {
            if let Some(handle) = active.worker.take() {
                join_worker(&class_id, handle).await;
            }
            tracing::info!(class = %class_id, "reaped finished session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::{catalog, frame_of, MarkerProvider, ScriptedSource};
    use rollcall_core::{BoundingBox, Embedding, Identity};
    use rollcall_hw::{CameraError, Frame, VideoSource};
    use rollcall_store::{
        identities, spawn_writer, AttendanceKey, AttendanceStatus, Store, WriterOptions,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Hands out scripted sources; fails the first `fail_first` opens.
    struct ScriptedOpener {
        script: Vec<Frame>,
        fail_first: AtomicUsize,
        released: Arc<AtomicBool>,
    }

    impl SourceOpener for ScriptedOpener {
        fn open(&self, device: &str) -> Result<Box<dyn VideoSource>, CameraError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CameraError::SourceUnavailable(format!("{device}: no such device")));
            }
            let frames: VecDeque<_> = self.script.iter().cloned().map(Ok).collect();
            Ok(Box::new(ScriptedSource {
                frames,
                released: Arc::clone(&self.released),
            }))
        }
    }

    struct MarkerFactory;

    impl ProviderFactory for MarkerFactory {
        fn create(&self) -> Result<Box<dyn FaceProvider>, ProviderError> {
            Ok(Box::new(MarkerProvider))
        }
    }

    /// Every frame read takes `delay`, so cancellation is only seen late.
    struct SlowOpener {
        delay: Duration,
    }

    struct SlowSource {
        delay: Duration,
    }

    impl VideoSource for SlowSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(self.delay);
            Ok(frame_of(1))
        }

        fn describe(&self) -> String {
            "slow".into()
        }
    }

    impl SourceOpener for SlowOpener {
        fn open(&self, _device: &str) -> Result<Box<dyn VideoSource>, CameraError> {
            Ok(Box::new(SlowSource { delay: self.delay }))
        }
    }

    /// Provider whose helper process is gone.
    struct ExitedProvider;

    impl FaceProvider for ExitedProvider {
        fn detect(
            &mut self,
            _frame: &[u8],
            _w: u32,
            _h: u32,
        ) -> Result<Vec<BoundingBox>, ProviderError> {
            Err(ProviderError::Exited)
        }

        fn embed(
            &mut self,
            _frame: &[u8],
            _w: u32,
            _h: u32,
            _face: &BoundingBox,
        ) -> Result<Embedding, ProviderError> {
            Err(ProviderError::Exited)
        }
    }

    struct ExitedFactory;

    impl ProviderFactory for ExitedFactory {
        fn create(&self) -> Result<Box<dyn FaceProvider>, ProviderError> {
            Ok(Box::new(ExitedProvider))
        }
    }

    fn options() -> ManagerOptions {
        ManagerOptions {
            device: "scripted".into(),
            tolerance: 0.4,
            catalog: CatalogOptions::default(),
            stop_timeout: Duration::from_secs(5),
            max_consecutive_failures: u32::MAX,
            preview_quality: None,
        }
    }

    fn seeded_store(roster_ids: &[&str]) -> Store {
        let mut store = Store::open_in_memory().unwrap();
        for n in 1..=3u8 {
            identities::replace_identity(
                store.connection_mut(),
                &Identity {
                    id: format!("S{n}"),
                    name: format!("Student {n}"),
                    references: vec![Embedding::new(vec![f32::from(n), 0.0])],
                },
            )
            .unwrap();
        }
        let ids: Vec<String> = roster_ids.iter().map(|s| s.to_string()).collect();
        roster::add_to_roster(store.connection_mut(), "MATH110", &ids).unwrap();
        store
    }

    fn manager(store: Store, opener: ScriptedOpener) -> (SessionManager, LedgerHandle) {
        build_manager(store, options(), Arc::new(opener), Arc::new(MarkerFactory))
    }

    fn build_manager(
        store: Store,
        options: ManagerOptions,
        opener: Arc<dyn SourceOpener>,
        providers: Arc<dyn ProviderFactory>,
    ) -> (SessionManager, LedgerHandle) {
        let ledger = spawn_writer(store, WriterOptions::default()).unwrap();
        let manager = SessionManager::new(options, ledger.clone(), catalog(&[]), opener, providers);
        (manager, ledger)
    }

    async fn wait_for_sequence(manager: &SessionManager, class_id: &str, sequence: u64) {
        let mut rx = manager.subscribe(class_id).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|snap| snap.as_ref().is_some_and(|s| s.sequence >= sequence)),
        )
        .await
        .expect("worker never reached sequence")
        .unwrap();
    }

    #[tokio::test]
    async fn test_math110_end_to_end() {
        let released = Arc::new(AtomicBool::new(false));
        let (manager, ledger) = manager(
            seeded_store(&["S1", "S2", "S3"]),
            ScriptedOpener {
                script: vec![frame_of(1), frame_of(1), frame_of(2)],
                fail_first: AtomicUsize::new(0),
                released: Arc::clone(&released),
            },
        );

        let info = manager.start_session("MATH110", "prof-7").await.unwrap();
        assert!(matches!(
            manager.start_session("MATH110", "prof-7").await,
            Err(SessionError::SessionAlreadyActive { .. })
        ));
        assert!(matches!(
            manager.start_session("PHYS200", "prof-7").await,
            Err(SessionError::DeviceInUse { .. })
        ));

        wait_for_sequence(&manager, "MATH110", 3).await;
        let snap = manager.snapshot("MATH110").await.unwrap().unwrap();
        assert_eq!(snap.roster.iter().filter(|r| r.present).count(), 2);

        let report = manager.stop_session("MATH110").await.unwrap();
        assert_eq!(report.session_id, info.id);
        assert_eq!(report.present, vec!["S1", "S2"]);
        assert_eq!(report.absent, vec!["S3"]);
        assert!(released.load(Ordering::SeqCst));

        let date = info.date;
        let records = ledger
            .call_async(move |conn| ledger::records_for(conn, "MATH110", date))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status, AttendanceStatus::Present);
        assert_eq!(records[0].last_sequence, 2);
        assert_eq!(records[1].status, AttendanceStatus::Present);
        assert_eq!(records[2].status, AttendanceStatus::Absent);
        assert_eq!(records[2].absences, 1);

        assert!(matches!(
            manager.stop_session("MATH110").await,
            Err(SessionError::NoActiveSession { .. })
        ));
        let key = AttendanceKey {
            identity_id: "S3".into(),
            class_id: "MATH110".into(),
            date,
        };
        let s3 = ledger
            .call_async(move |conn| ledger::record(conn, &key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s3.absences, 1);
        assert!(manager.status().await.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_source_registers_nothing() {
        let (manager, _ledger) = manager(
            seeded_store(&["S1"]),
            ScriptedOpener {
                script: vec![frame_of(1)],
                fail_first: AtomicUsize::new(1),
                released: Arc::new(AtomicBool::new(false)),
            },
        );

        assert!(matches!(
            manager.start_session("MATH110", "prof-7").await,
            Err(SessionError::SourceUnavailable(_))
        ));
        assert!(manager.status().await.sessions.is_empty());
        assert!(matches!(
            manager.snapshot("MATH110").await,
            Err(SessionError::NoActiveSession { .. })
        ));

        manager.start_session("MATH110", "prof-7").await.unwrap();
        wait_for_sequence(&manager, "MATH110", 1).await;
        let report = manager.stop_session("MATH110").await.unwrap();
        assert_eq!(report.present, vec!["S1"]);
    }

    #[tokio::test]
    async fn test_reload_catalog_counts_identities() {
        let (manager, _ledger) = manager(
            seeded_store(&[]),
            ScriptedOpener {
                script: Vec::new(),
                fail_first: AtomicUsize::new(0),
                released: Arc::new(AtomicBool::new(false)),
            },
        );
        assert_eq!(manager.reload_catalog().await.unwrap(), 3);
        let status = manager.status().await;
        assert_eq!(status.catalog_identities, 3);
        assert_eq!(status.catalog_references, 3);
    }

    #[tokio::test]
    async fn test_refresh_catalog_skips_unchanged_enrollments() {
        let (manager, ledger) = manager(
            seeded_store(&[]),
            ScriptedOpener {
                script: Vec::new(),
                fail_first: AtomicUsize::new(0),
                released: Arc::new(AtomicBool::new(false)),
            },
        );
        assert!(manager.refresh_catalog().await.unwrap());
        assert!(!manager.refresh_catalog().await.unwrap());

        ledger
            .call_async(|conn| identities::remove_identity(conn, "S3"))
            .await
            .unwrap();
        assert!(manager.refresh_catalog().await.unwrap());
        assert_eq!(manager.status().await.catalog_identities, 2);
    }

    #[tokio::test]
    async fn test_stop_times_out_then_retries() {
        let (manager, _ledger) = build_manager(
            seeded_store(&["S1", "S2"]),
            ManagerOptions {
                stop_timeout: Duration::from_millis(50),
                ..options()
            },
            Arc::new(SlowOpener {
                delay: Duration::from_millis(300),
            }),
            Arc::new(MarkerFactory),
        );

        manager.start_session("MATH110", "prof-7").await.unwrap();
        assert!(matches!(
            manager.stop_session("MATH110").await,
            Err(SessionError::StopTimedOut { timeout_ms: 50, .. })
        ));
        assert_eq!(manager.status().await.sessions.len(), 1);
        assert!(manager.snapshot("MATH110").await.is_ok());

        tokio::time::sleep(Duration::from_millis(700)).await;
        let report = manager.stop_session("MATH110").await.unwrap();
        assert_eq!(report.present.len() + report.absent.len(), 2);
        assert!(manager.status().await.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_provider_exit_closes_session() {
        let released = Arc::new(AtomicBool::new(false));
        let (manager, ledger) = build_manager(
            seeded_store(&["S1", "S2"]),
            options(),
            Arc::new(ScriptedOpener {
                script: vec![frame_of(1)],
                fail_first: AtomicUsize::new(0),
                released: Arc::clone(&released),
            }),
            Arc::new(ExitedFactory),
        );

        let info = manager.start_session("MATH110", "prof-7").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager
                .status()
                .await
                .sessions
                .iter()
                .any(|s| s.phase != SessionPhase::Closed)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never closed after provider exit");
        assert!(released.load(Ordering::SeqCst));

        let report = manager.stop_session("MATH110").await.unwrap();
        assert!(report.present.is_empty());
        assert_eq!(report.absent, vec!["S1", "S2"]);

        let date = info.date;
        let records = ledger
            .call_async(move |conn| ledger::records_for(conn, "MATH110", date))
            .await
            .unwrap();
        assert!(records.iter().all(|r| r.status == AttendanceStatus::Absent));
        assert_eq!(records.len(), 2);
    }
}
