//! Attendance ledger: one row per (identity, class, date).
//!
//! Row rules:
//! - a sighting inserts `Present`, or refreshes the recognition time of an
//!   existing row; an `Absent` row is promoted to `Present`, never the reverse
//! - a sighting older (by frame sequence) than the one stored for the same
//!   session is ignored
//! - reconciliation inserts `Absent` with a count of 1, bumps the count of an
//!   `Absent` row left by an earlier session, and leaves rows it already
//!   marked (or `Present` rows) untouched

use crate::sessions::{self, SessionStatus};
use crate::{format_date, parse_date, parse_optional_datetime, StoreError};
use chrono::{DateTime, Local, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "Present" => Ok(AttendanceStatus::Present),
            "Absent" => Ok(AttendanceStatus::Absent),
            other => Err(StoreError::Corrupt {
                field: "attendance.status",
                reason: format!("unknown status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttendanceKey {
    pub identity_id: String,
    pub class_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub recognized_at: Option<DateTime<Local>>,
    /// Times reconciliation has marked this row absent.
    pub absences: u32,
    pub operator_id: String,
    pub session_id: String,
    pub last_sequence: u64,
}

/// A confirmed sighting to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentMark {
    pub key: AttendanceKey,
    pub at: DateTime<Local>,
    pub operator_id: String,
    pub session_id: String,
    /// Frame sequence within the session.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbsentMark {
    pub key: AttendanceKey,
    pub operator_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Inserted,
    Refreshed,
    Promoted,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentOutcome {
    Inserted,
    Incremented,
    AlreadyMarked,
    KeptPresent,
}

/// Every write of one end-of-session reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileBatch {
    pub session_id: String,
    pub stopped_at: DateTime<Local>,
    pub present: Vec<PresentMark>,
    pub absent: Vec<AbsentMark>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub present: usize,
    pub absent_inserted: usize,
    pub absent_incremented: usize,
    pub unchanged: usize,
}

fn row_to_record(row: &Row<'_>) -> Result<AttendanceRecord, StoreError> {
    let date: String = row.get("date")?;
    let status: String = row.get("status")?;
    let recognized_at: Option<String> = row.get("recognized_at")?;
    let absences: i64 = row.get("absences")?;
    let last_sequence: i64 = row.get("last_sequence")?;

    Ok(AttendanceRecord {
        identity_id: row.get("enrollment")?,
        class_id: row.get("class_id")?,
        date: parse_date(&date, "attendance.date")?,
        status: AttendanceStatus::parse(&status)?,
        recognized_at: parse_optional_datetime(recognized_at, "attendance.recognized_at")?,
        absences: u32::try_from(absences).map_err(|_| StoreError::Corrupt {
            field: "attendance.absences",
            reason: format!("out of range: {absences}"),
        })?,
        operator_id: row.get("operator_id")?,
        session_id: row.get("session_id")?,
        last_sequence: u64::try_from(last_sequence).map_err(|_| StoreError::Corrupt {
            field: "attendance.last_sequence",
            reason: format!("negative: {last_sequence}"),
        })?,
    })
}

fn sequence_param(sequence: u64) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

const RECORD_COLUMNS: &str = "enrollment, class_id, date, status, recognized_at, absences, \
                              operator_id, session_id, last_sequence";

pub fn record(
    conn: &Connection,
    key: &AttendanceKey,
) -> Result<Option<AttendanceRecord>, StoreError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM attendance
         WHERE enrollment = ?1 AND class_id = ?2 AND date = ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row(
        params![key.identity_id, key.class_id, format_date(key.date)],
        |row| Ok(row_to_record(row)),
    )
    .optional()?
    .transpose()
}

pub fn records_for(
    conn: &Connection,
    class_id: &str,
    date: NaiveDate,
) -> Result<Vec<AttendanceRecord>, StoreError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM attendance
         WHERE class_id = ?1 AND date = ?2 ORDER BY enrollment"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![class_id, format_date(date)])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(row_to_record(row)?);
    }
    Ok(records)
}

/// Running absence total per identity: days with an `Absent` row.
pub fn absence_totals(
    conn: &Connection,
    class_id: &str,
) -> Result<HashMap<String, u32>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT enrollment, COUNT(*) FROM attendance
         WHERE class_id = ?1 AND status = 'Absent'
         GROUP BY enrollment",
    )?;
    let totals = stmt
        .query_map(params![class_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(totals
        .into_iter()
        .map(|(id, count)| (id, u32::try_from(count).unwrap_or(u32::MAX)))
        .collect())
}

pub fn upsert_present(conn: &Connection, mark: &PresentMark) -> Result<PresentOutcome, StoreError> {
    let key = &mark.key;
    let Some(existing) = record(conn, key)? else {
        conn.execute(
            "INSERT INTO attendance
                (enrollment, class_id, date, status, recognized_at, absences, operator_id, session_id, last_sequence)
             VALUES (?1, ?2, ?3, 'Present', ?4, 0, ?5, ?6, ?7)",
            params![
                key.identity_id,
                key.class_id,
                format_date(key.date),
                mark.at.to_rfc3339(),
                mark.operator_id,
                mark.session_id,
                sequence_param(mark.sequence),
            ],
        )?;
        return Ok(PresentOutcome::Inserted);
    };

    if existing.session_id == mark.session_id && mark.sequence < existing.last_sequence {
        return Ok(PresentOutcome::Stale);
    }

    conn.execute(
        "UPDATE attendance
         SET status = 'Present', recognized_at = ?4, session_id = ?5, last_sequence = ?6
         WHERE enrollment = ?1 AND class_id = ?2 AND date = ?3",
        params![
            key.identity_id,
            key.class_id,
            format_date(key.date),
            mark.at.to_rfc3339(),
            mark.session_id,
            sequence_param(mark.sequence),
        ],
    )?;

    Ok(match existing.status {
        AttendanceStatus::Present => PresentOutcome::Refreshed,
        AttendanceStatus::Absent => PresentOutcome::Promoted,
    })
}

pub fn upsert_absent(conn: &Connection, mark: &AbsentMark) -> Result<AbsentOutcome, StoreError> {
    let key = &mark.key;
    let Some(existing) = record(conn, key)? else {
        conn.execute(
            "INSERT INTO attendance
                (enrollment, class_id, date, status, recognized_at, absences, operator_id, session_id, last_sequence)
             VALUES (?1, ?2, ?3, 'Absent', NULL, 1, ?4, ?5, 0)",
            params![
                key.identity_id,
                key.class_id,
                format_date(key.date),
                mark.operator_id,
                mark.session_id,
            ],
        )?;
        return Ok(AbsentOutcome::Inserted);
    };

    match existing.status {
        AttendanceStatus::Present => Ok(AbsentOutcome::KeptPresent),
        AttendanceStatus::Absent if existing.session_id == mark.session_id => {
            Ok(AbsentOutcome::AlreadyMarked)
        }
        AttendanceStatus::Absent => {
            conn.execute(
                "UPDATE attendance SET absences = absences + 1, session_id = ?4
                 WHERE enrollment = ?1 AND class_id = ?2 AND date = ?3",
                params![
                    key.identity_id,
                    key.class_id,
                    format_date(key.date),
                    mark.session_id,
                ],
            )?;
            Ok(AbsentOutcome::Incremented)
        }
    }
}

/// Apply a reconciliation batch and close its session row in one
/// transaction. Any failure rolls the whole batch back.
pub fn reconcile(
    conn: &mut Connection,
    batch: &ReconcileBatch,
) -> Result<ReconcileReport, StoreError> {
    let tx = conn.transaction()?;
    let mut report = ReconcileReport::default();

    for mark in &batch.present {
        match upsert_present(&tx, mark)? {
            PresentOutcome::Stale => report.unchanged += 1,
            _ => report.present += 1,
        }
    }

    for mark in &batch.absent {
        match upsert_absent(&tx, mark)? {
            AbsentOutcome::Inserted => report.absent_inserted += 1,
            AbsentOutcome::Incremented => report.absent_incremented += 1,
            AbsentOutcome::AlreadyMarked | AbsentOutcome::KeptPresent => report.unchanged += 1,
        }
    }

    sessions::close_session(&tx, &batch.session_id, batch.stopped_at, SessionStatus::Closed)?;
    tx.commit()?;

    tracing::info!(
        session = %batch.session_id,
        present = report.present,
        absent_inserted = report.absent_inserted,
        absent_incremented = report.absent_incremented,
        unchanged = report.unchanged,
        "reconciliation committed"
    );
    Ok(report)
}
