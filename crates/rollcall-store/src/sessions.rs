//! Persisted session metadata.

use crate::{format_date, parse_date, parse_datetime, parse_optional_datetime, StoreError};
use chrono::{DateTime, Local, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Closed,
    /// Left active by a daemon that exited without reconciling.
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "Active",
            SessionStatus::Closed => "Closed",
            SessionStatus::Interrupted => "Interrupted",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "Active" => Ok(SessionStatus::Active),
            "Closed" => Ok(SessionStatus::Closed),
            "Interrupted" => Ok(SessionStatus::Interrupted),
            other => Err(StoreError::Corrupt {
                field: "sessions.status",
                reason: format!("unknown status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: String,
    pub class_id: String,
    pub operator_id: String,
    pub date: NaiveDate,
    pub started_at: DateTime<Local>,
    pub stopped_at: Option<DateTime<Local>>,
    pub status: SessionStatus,
}

fn row_to_session(row: &Row<'_>) -> Result<SessionRow, StoreError> {
    let date: String = row.get("date")?;
    let started_at: String = row.get("started_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let status: String = row.get("status")?;

    Ok(SessionRow {
        id: row.get("id")?,
        class_id: row.get("class_id")?,
        operator_id: row.get("operator_id")?,
        date: parse_date(&date, "sessions.date")?,
        started_at: parse_datetime(&started_at, "sessions.started_at")?,
        stopped_at: parse_optional_datetime(stopped_at, "sessions.stopped_at")?,
        status: SessionStatus::parse(&status)?,
    })
}

pub fn insert_session(conn: &Connection, session: &SessionRow) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sessions (id, class_id, operator_id, date, started_at, stopped_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session.id,
            session.class_id,
            session.operator_id,
            format_date(session.date),
            session.started_at.to_rfc3339(),
            session.stopped_at.map(|dt| dt.to_rfc3339()),
            session.status.as_str(),
        ],
    )?;
    Ok(())
}

pub fn close_session(
    conn: &Connection,
    session_id: &str,
    stopped_at: DateTime<Local>,
    status: SessionStatus,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET stopped_at = ?1, status = ?2 WHERE id = ?3",
        params![stopped_at.to_rfc3339(), status.as_str(), session_id],
    )?;
    Ok(())
}

pub fn get_session(conn: &Connection, session_id: &str) -> Result<Option<SessionRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, class_id, operator_id, date, started_at, stopped_at, status
         FROM sessions WHERE id = ?1",
    )?;
    let row = stmt
        .query_row(params![session_id], |row| Ok(row_to_session(row)))
        .optional()?;
    row.transpose()
}

/// Mark sessions a previous daemon left active as interrupted.
pub fn interrupt_stale_sessions(
    conn: &Connection,
    now: DateTime<Local>,
) -> Result<Vec<SessionRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, class_id, operator_id, date, started_at, stopped_at, status
         FROM sessions WHERE status = 'Active' ORDER BY started_at",
    )?;
    let mut rows = stmt.query([])?;
    let mut stale = Vec::new();
    while let Some(row) = rows.next()? {
        stale.push(row_to_session(row)?);
    }
    drop(rows);

    for session in &stale {
        close_session(conn, &session.id, now, SessionStatus::Interrupted)?;
    }
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use chrono::TimeZone;

    fn session(id: &str) -> SessionRow {
        SessionRow {
            id: id.into(),
            class_id: "MATH110".into(),
            operator_id: "prof-7".into(),
            date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            started_at: Local.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap(),
            stopped_at: None,
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn test_insert_close_get() {
        let store = Store::open_in_memory().unwrap();
        insert_session(store.connection(), &session("a")).unwrap();
        let stop = Local.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap();
        close_session(store.connection(), "a", stop, SessionStatus::Closed).unwrap();

        let row = get_session(store.connection(), "a").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Closed);
        assert_eq!(row.stopped_at, Some(stop));
        assert!(get_session(store.connection(), "missing").unwrap().is_none());
    }

    #[test]
    fn test_interrupt_stale_sessions() {
        let store = Store::open_in_memory().unwrap();
        insert_session(store.connection(), &session("a")).unwrap();
        insert_session(store.connection(), &session("b")).unwrap();
        close_session(store.connection(), "b", Local::now(), SessionStatus::Closed).unwrap();

        let stale = interrupt_stale_sessions(store.connection(), Local::now()).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "a");
        let row = get_session(store.connection(), "a").unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Interrupted);
    }
}
