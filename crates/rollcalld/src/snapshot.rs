//! Live per-frame view of a session for observers.

use crate::session::Session;
use chrono::{DateTime, Local};
use rollcall_core::BoundingBox;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

pub type SnapshotSender = watch::Sender<Option<Arc<Snapshot>>>;
pub type SnapshotReceiver = watch::Receiver<Option<Arc<Snapshot>>>;

/// A detected face and what the matcher made of it.
#[derive(Debug, Clone, Serialize)]
pub struct RecognizedRegion {
    pub bbox: BoundingBox,
    pub identity_id: Option<String>,
    pub name: Option<String>,
    /// Distance to the closest reference, when the catalog had one.
    pub distance: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterStatus {
    pub identity_id: String,
    pub name: Option<String>,
    pub present: bool,
    pub last_seen: Option<DateTime<Local>>,
    pub absences: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub session_id: String,
    pub class_id: String,
    pub sequence: u64,
    pub captured_at: DateTime<Local>,
    pub regions: Vec<RecognizedRegion>,
    pub roster: Vec<RosterStatus>,
    pub accuracy: f32,
    /// Grayscale JPEG of the frame; served separately from the JSON view.
    #[serde(skip)]
    pub preview: Option<Vec<u8>>,
}

pub fn channel() -> (SnapshotSender, SnapshotReceiver) {
    watch::channel(None)
}

pub fn build(
    session: &Session,
    sequence: u64,
    captured_at: DateTime<Local>,
    regions: Vec<RecognizedRegion>,
    preview: Option<Vec<u8>>,
) -> Snapshot {
    let recognized = session.recognized();
    let roster = session
        .roster()
        .iter()
        .map(|entry| {
            let last_seen = recognized.get(&entry.identity_id).copied();
            RosterStatus {
                identity_id: entry.identity_id.clone(),
                name: entry.name.clone(),
                present: last_seen.is_some(),
                last_seen,
                absences: session.absence_total(&entry.identity_id),
            }
        })
        .collect();

    Snapshot {
        session_id: session.info().id.clone(),
        class_id: session.info().class_id.clone(),
        sequence,
        captured_at,
        regions,
        roster,
        accuracy: session.accuracy(),
        preview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::roster;
    use crate::session::SessionInfo;
    use rollcall_store::{spawn_writer, Store, WriterOptions};
    use std::collections::HashMap;

    #[test]
    fn test_snapshot_reflects_roster_state() {
        let ledger =
            spawn_writer(Store::open_in_memory().unwrap(), WriterOptions::default()).unwrap();
        let now = Local::now();
        let session = Session::new(
            SessionInfo {
                id: "sess".into(),
                class_id: "MATH110".into(),
                operator_id: "prof-7".into(),
                date: now.date_naive(),
                started_at: now,
                device: "/dev/video0".into(),
            },
            roster(&["S1", "S2"]),
            HashMap::from([("S2".to_string(), 3)]),
            ledger,
        );
        session.start().unwrap();
        session.mark_seen("S1", now, 1).unwrap();

        let snap = build(&session, 1, now, Vec::new(), Some(vec![0xff, 0xd8]));
        assert_eq!(snap.roster.len(), 2);
        assert!(snap.roster[0].present);
        assert_eq!(snap.roster[0].last_seen, Some(now));
        assert!(!snap.roster[1].present);
        assert_eq!(snap.roster[1].absences, 3);
        assert_eq!(snap.accuracy, 50.0);

        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("preview").is_none());
        assert_eq!(json["class_id"], "MATH110");
    }
}
