//! Capture worker: frames in, sightings and snapshots out.

use crate::session::{Session, SessionError, StopReport};
use crate::snapshot::{self, RecognizedRegion, SnapshotSender};
use chrono::Local;
use rollcall_core::{
    CatalogHandle, EuclideanMatcher, FaceProvider, MatchOutcome, Matcher, ProviderError,
};
use rollcall_hw::{Frame, VideoSource};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureExit {
    Cancelled,
    SourceFailed(String),
    ProviderFailed(String),
    Panicked,
}

/// Reported to the manager once the worker has released its source and
/// closed the session.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub exit: CaptureExit,
    pub frames: u64,
    pub stop: Result<StopReport, SessionError>,
}

pub struct CaptureWorker {
    pub session: Arc<Session>,
    pub source: Box<dyn VideoSource>,
    pub provider: Box<dyn FaceProvider>,
    pub catalog: CatalogHandle,
    pub tolerance: f32,
    pub max_consecutive_failures: u32,
    pub preview_quality: Option<u8>,
    pub snapshots: SnapshotSender,
    pub cancel: CancellationToken,
}

impl CaptureWorker {
    /// Run the loop on its own OS thread. `done` receives the outcome after
    /// the source is dropped and the session stopped.
    pub fn spawn(self, done: oneshot::Sender<CaptureOutcome>) -> std::io::Result<JoinHandle<()>> {
        let name = format!("rollcall-capture-{}", self.session.info().class_id);
        std::thread::Builder::new().name(name).spawn(move || {
            let session = Arc::clone(&self.session);
            let (exit, frames) = match panic::catch_unwind(AssertUnwindSafe(move || self.run())) {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(session = %session.info().id, "capture loop panicked");
                    (CaptureExit::Panicked, 0)
                }
            };

            let stop = session.stop(Local::now());
            if let Err(err) = &stop {
                tracing::error!(session = %session.info().id, error = %err, "session stop failed");
            }
            tracing::info!(session = %session.info().id, ?exit, frames, "capture worker finished");
            if done.send(CaptureOutcome { exit, frames, stop }).is_err() {
                tracing::debug!("manager no longer waiting for capture outcome");
            }
        })
    }

    /// Consumes the worker so the source and provider are dropped on return.
    fn run(mut self) -> (CaptureExit, u64) {
        tracing::info!(
            session = %self.session.info().id,
            source = %self.source.describe(),
            "capture loop started"
        );
        let mut sequence: u64 = 0;
        let mut failures: u32 = 0;

        let exit = loop {
            if self.cancel.is_cancelled() {
                break CaptureExit::Cancelled;
            }

            let frame = match self.source.next_frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if failures >= self.max_consecutive_failures {
                        break CaptureExit::SourceFailed(format!(
                            "{failures} consecutive failures, last: {err}"
                        ));
                    }
                    tracing::debug!(error = %err, failures, "frame read failed");
                    continue;
                }
                Err(err) => break CaptureExit::SourceFailed(err.to_string()),
            };

            if frame.is_dark || frame.is_short() {
                tracing::trace!(dark = frame.is_dark, "skipping unusable frame");
                continue;
            }

            sequence += 1;
            match self.process(&frame, sequence) {
                Ok(()) => {}
                Err(ProviderError::Exited) => {
                    break CaptureExit::ProviderFailed(ProviderError::Exited.to_string())
                }
                Err(err) => {
                    tracing::warn!(sequence, error = %err, "face detection failed; frame skipped")
                }
            }
        };

        (exit, sequence)
    }

    fn process(&mut self, frame: &Frame, sequence: u64) -> Result<(), ProviderError> {
        let captured_at = Local::now();
        let catalog = self.catalog.current();
        let faces = self.provider.detect(&frame.data, frame.width, frame.height)?;

        let mut regions = Vec::with_capacity(faces.len());
        for face in faces {
            let probe = match self.provider.embed(&frame.data, frame.width, frame.height, &face) {
                Ok(probe) => probe,
                Err(ProviderError::Exited) => return Err(ProviderError::Exited),
                Err(err) => {
                    tracing::debug!(sequence, error = %err, "embedding failed; face skipped");
                    continue;
                }
            };

            let outcome = match EuclideanMatcher.best_match(&probe, &catalog, self.tolerance) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::debug!(sequence, error = %err, "probe rejected");
                    continue;
                }
            };

            match outcome {
                MatchOutcome::Match {
                    identity_id,
                    name,
                    distance,
                    ..
                } => {
                    match self.session.mark_seen(&identity_id, captured_at, sequence) {
                        Ok(_) => {}
                        Err(SessionError::NotEnrolled { .. }) => {
                            tracing::debug!(
                                identity = %identity_id,
                                "recognized identity not on roster"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                identity = %identity_id,
                                error = %err,
                                "sighting not recorded"
                            );
                        }
                    }
                    regions.push(RecognizedRegion {
                        bbox: face,
                        identity_id: Some(identity_id),
                        name: Some(name),
                        distance: Some(distance),
                    });
                }
                MatchOutcome::NoMatch { closest } => regions.push(RecognizedRegion {
                    bbox: face,
                    identity_id: None,
                    name: None,
                    distance: closest,
                }),
            }
        }

        let preview = self.preview_quality.and_then(|quality| match frame.encode_jpeg(quality) {
            Ok(jpeg) => Some(jpeg),
            Err(err) => {
                tracing::debug!(error = %err, "preview encoding failed");
                None
            }
        });
        let snap = snapshot::build(&self.session, sequence, captured_at, regions, preview);
        self.snapshots.send_replace(Some(Arc::new(snap)));
        Ok(())
    }
}
