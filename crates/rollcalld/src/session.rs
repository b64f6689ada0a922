//! One attendance session: phase, recognition set and reconciliation.

use chrono::{DateTime, Local, NaiveDate};
use rollcall_core::CatalogError;
use rollcall_store::{
    AbsentMark, AttendanceKey, LedgerError, LedgerHandle, PresentMark, ReconcileBatch,
    ReconcileReport, RosterEntry, SessionRow, SessionStatus,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session for class {class_id} is already active")]
    SessionAlreadyActive { class_id: String },
    #[error("device {device} is in use by class {class_id}")]
    DeviceInUse { device: String, class_id: String },
    #[error("no active session for class {class_id}")]
    NoActiveSession { class_id: String },
    #[error("session is not active")]
    NotActive,
    #[error("{identity_id} is not on the roster of {class_id}")]
    NotEnrolled {
        identity_id: String,
        class_id: String,
    },
    #[error("video source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("embedding catalog unavailable: {0}")]
    CatalogUnavailable(#[from] CatalogError),
    #[error("face provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("attendance ledger write failed: {0}")]
    LedgerWriteFailed(#[from] LedgerError),
    #[error("capture worker for class {class_id} did not stop within {timeout_ms} ms")]
    StopTimedOut { class_id: String, timeout_ms: u64 },
    #[error("capture worker failed to start: {0}")]
    WorkerSpawn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Idle,
    Active,
    Reconciling,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub class_id: String,
    pub operator_id: String,
    pub date: NaiveDate,
    pub started_at: DateTime<Local>,
    pub device: String,
}

/// What a reconciliation decided.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub session_id: String,
    pub class_id: String,
    pub present: Vec<String>,
    pub absent: Vec<String>,
    pub accuracy: f32,
    pub ledger: ReconcileReport,
}

/// Result of a sighting at the recognition-set level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    First,
    Again,
    /// Older than a sighting already recorded; nothing was written.
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Sighting {
    at: DateTime<Local>,
    sequence: u64,
}

struct SessionState {
    phase: SessionPhase,
    recognized: HashMap<String, Sighting>,
    report: Option<StopReport>,
}

pub struct Session {
    info: SessionInfo,
    roster: Vec<RosterEntry>,
    roster_ids: HashSet<String>,
    /// Running absence totals when the session was opened.
    absence_totals: HashMap<String, u32>,
    ledger: LedgerHandle,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        info: SessionInfo,
        roster: Vec<RosterEntry>,
        absence_totals: HashMap<String, u32>,
        ledger: LedgerHandle,
    ) -> Self {
        let roster_ids = roster.iter().map(|e| e.identity_id.clone()).collect();
        Self {
            info,
            roster,
            roster_ids,
            absence_totals,
            ledger,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Idle,
                recognized: HashMap::new(),
                report: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn absence_total(&self, identity_id: &str) -> u32 {
        self.absence_totals.get(identity_id).copied().unwrap_or(0)
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    /// Recognized identities with their latest sighting time.
    pub fn recognized(&self) -> HashMap<String, DateTime<Local>> {
        self.state()
            .recognized
            .iter()
            .map(|(id, s)| (id.clone(), s.at))
            .collect()
    }

    pub fn accuracy(&self) -> f32 {
        let state = self.state();
        rollcall_core::recognition_accuracy(
            state.recognized.keys().map(String::as_str),
            self.roster_ids.iter().map(String::as_str),
        )
    }

    /// Record the session row and begin accepting sightings.
    pub fn start(&self) -> Result<(), SessionError> {
        {
            let state = self.state();
            if state.phase != SessionPhase::Idle {
                return Err(SessionError::NotActive);
            }
        }

        let row = SessionRow {
            id: self.info.id.clone(),
            class_id: self.info.class_id.clone(),
            operator_id: self.info.operator_id.clone(),
            date: self.info.date,
            started_at: self.info.started_at,
            stopped_at: None,
            status: SessionStatus::Active,
        };
        self.ledger
            .call(move |conn| rollcall_store::sessions::insert_session(conn, &row))?;

        self.state().phase = SessionPhase::Active;
        tracing::info!(
            session = %self.info.id,
            class = %self.info.class_id,
            roster = self.roster.len(),
            "session started"
        );
        Ok(())
    }

    /// Register a sighting and queue its present mark.
    pub fn mark_seen(
        &self,
        identity_id: &str,
        at: DateTime<Local>,
        sequence: u64,
    ) -> Result<Seen, SessionError> {
        let seen = {
            let mut state = self.state();
            if state.phase != SessionPhase::Active {
                return Err(SessionError::NotActive);
            }
            if !self.roster_ids.contains(identity_id) {
                return Err(SessionError::NotEnrolled {
                    identity_id: identity_id.to_string(),
                    class_id: self.info.class_id.clone(),
                });
            }

            match state.recognized.get_mut(identity_id) {
                Some(previous) if sequence < previous.sequence => Seen::Stale,
                Some(previous) => {
                    *previous = Sighting { at, sequence };
                    Seen::Again
                }
                None => {
                    state
                        .recognized
                        .insert(identity_id.to_string(), Sighting { at, sequence });
                    Seen::First
                }
            }
        };

        if seen == Seen::Stale {
            return Ok(seen);
        }
        if seen == Seen::First {
            tracing::info!(identity = identity_id, class = %self.info.class_id, "recognized");
        }

        self.ledger.submit_present(PresentMark {
            key: self.key(identity_id),
            at,
            operator_id: self.info.operator_id.clone(),
            session_id: self.info.id.clone(),
            sequence,
        })?;
        Ok(seen)
    }

    fn key(&self, identity_id: &str) -> AttendanceKey {
        AttendanceKey {
            identity_id: identity_id.to_string(),
            class_id: self.info.class_id.clone(),
            date: self.info.date,
        }
    }

    /// Reconcile and close. Safe to call again: a closed session returns
    /// its report, a failed reconciliation is retried.
    pub fn stop(&self, stopped_at: DateTime<Local>) -> Result<StopReport, SessionError> {
        let (present, batch) = {
            let mut state = self.state();
            match state.phase {
                SessionPhase::Closed => {
                    if let Some(report) = &state.report {
                        return Ok(report.clone());
                    }
                    return Ok(self.empty_report());
                }
                SessionPhase::Idle => {
                    state.phase = SessionPhase::Closed;
                    let report = self.empty_report();
                    state.report = Some(report.clone());
                    return Ok(report);
                }
                SessionPhase::Active | SessionPhase::Reconciling => {
                    state.phase = SessionPhase::Reconciling;
                }
            }

            let mut present: Vec<(String, Sighting)> = state
                .recognized
                .iter()
                .map(|(id, s)| (id.clone(), *s))
                .collect();
            present.sort_by(|a, b| a.0.cmp(&b.0));

            let absent: Vec<AbsentMark> = self
                .roster
                .iter()
                .filter(|e| !state.recognized.contains_key(&e.identity_id))
                .map(|e| AbsentMark {
                    key: self.key(&e.identity_id),
                    operator_id: self.info.operator_id.clone(),
                    session_id: self.info.id.clone(),
                })
                .collect();

            let batch = ReconcileBatch {
                session_id: self.info.id.clone(),
                stopped_at,
                present: present
                    .iter()
                    .map(|(id, s)| PresentMark {
                        key: self.key(id),
                        at: s.at,
                        operator_id: self.info.operator_id.clone(),
                        session_id: self.info.id.clone(),
                        sequence: s.sequence,
                    })
                    .collect(),
                absent,
            };
            (present, batch)
        };

        let absent_ids: Vec<String> = batch
            .absent
            .iter()
            .map(|m| m.key.identity_id.clone())
            .collect();

        let ledger = match self.ledger.reconcile(batch) {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(
                    session = %self.info.id,
                    error = %err,
                    "reconciliation failed; session left reconciling"
                );
                return Err(err.into());
            }
        };

        let report = StopReport {
            session_id: self.info.id.clone(),
            class_id: self.info.class_id.clone(),
            present: present.into_iter().map(|(id, _)| id).collect(),
            absent: absent_ids,
            accuracy: self.accuracy(),
            ledger,
        };

        let mut state = self.state();
        state.phase = SessionPhase::Closed;
        state.report = Some(report.clone());
        tracing::info!(
            session = %self.info.id,
            class = %self.info.class_id,
            present = report.present.len(),
            absent = report.absent.len(),
            accuracy = report.accuracy,
            "session closed"
        );
        Ok(report)
    }

    /// Close without reconciling, for a session whose capture never ran.
    /// The row is marked interrupted and no attendance is written.
    pub fn abandon(&self, at: DateTime<Local>) -> Result<(), SessionError> {
        {
            let mut state = self.state();
            match state.phase {
                SessionPhase::Closed => return Ok(()),
                SessionPhase::Idle => {
                    state.phase = SessionPhase::Closed;
                    state.report = Some(self.empty_report());
                    return Ok(());
                }
                SessionPhase::Active | SessionPhase::Reconciling => {}
            }
        }

        let id = self.info.id.clone();
        self.ledger.call(move |conn| {
            rollcall_store::sessions::close_session(conn, &id, at, SessionStatus::Interrupted)
        })?;

        let mut state = self.state();
        state.phase = SessionPhase::Closed;
        state.report = Some(self.empty_report());
        tracing::warn!(session = %self.info.id, class = %self.info.class_id, "session abandoned");
        Ok(())
    }

    fn empty_report(&self) -> StopReport {
        StopReport {
            session_id: self.info.id.clone(),
            class_id: self.info.class_id.clone(),
            present: Vec::new(),
            absent: Vec::new(),
            accuracy: 0.0,
            ledger: ReconcileReport::default(),
        }
    }
}
