use crate::manager::SessionManager;
use crate::session::SessionError;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    manager: Arc<SessionManager>,
}

impl AttendanceService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

fn failed(err: SessionError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a capture session for a class. Returns the session id.
    async fn start_session(&self, class_id: &str, operator_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(class = class_id, operator = operator_id, "start requested");
        match self.manager.start_session(class_id, operator_id).await {
            Ok(info) => Ok(info.id),
            Err(err) => {
                tracing::warn!(class = class_id, error = %err, "start refused");
                Err(failed(err))
            }
        }
    }

    /// Stop a class's session. Returns the reconciliation report as JSON.
    async fn stop_session(&self, class_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(class = class_id, "stop requested");
        let report = self.manager.stop_session(class_id).await.map_err(|err| {
            tracing::warn!(class = class_id, error = %err, "stop failed");
            failed(err)
        })?;
        to_json(&report)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.manager.status().await)
    }

    /// Latest snapshot as JSON, or `null` before the first frame.
    async fn snapshot(&self, class_id: &str) -> zbus::fdo::Result<String> {
        let snap = self.manager.snapshot(class_id).await.map_err(failed)?;
        to_json(&snap.as_deref())
    }

    /// JPEG preview of the latest frame; empty when previews are off.
    async fn snapshot_preview(&self, class_id: &str) -> zbus::fdo::Result<Vec<u8>> {
        let snap = self.manager.snapshot(class_id).await.map_err(failed)?;
        Ok(snap.and_then(|s| s.preview.clone()).unwrap_or_default())
    }

    /// Reload enrolled identities. Returns how many were loaded.
    async fn reload_catalog(&self) -> zbus::fdo::Result<u32> {
        let count = self.manager.reload_catalog().await.map_err(failed)?;
        tracing::info!(identities = count, "catalog reloaded");
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
