//! Face detection and embedding provider interface.
//!
//! Detection and embedding are an external capability. [`SidecarProvider`]
//! drives a helper process over newline-delimited JSON on its stdio:
//!
//! ```text
//! → {"op":"detect","frame":7,"width":640,"height":360,"bytes":230400}\n<raw grayscale bytes>
//! ← {"faces":[{"x":..,"y":..,"width":..,"height":..,"confidence":..}]}
//! → {"op":"embed","frame":7,"face":{..}}
//! ← {"embedding":[..]}
//! ← {"error":"reason"}            (either request)
//! ```
//!
//! `embed` always refers to the frame sent by the most recent `detect`.

use crate::types::{BoundingBox, Embedding};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to start provider `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("provider I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed provider response: {0}")]
    Protocol(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("provider exited")]
    Exited,
}

/// Black-box face detection and embedding extraction over grayscale frames.
pub trait FaceProvider: Send {
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, ProviderError>;

    fn embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, ProviderError>;
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Detect {
        frame: u64,
        width: u32,
        height: u32,
        bytes: usize,
    },
    Embed {
        frame: u64,
        face: &'a BoundingBox,
    },
}

#[derive(Deserialize, Debug, Default)]
struct Response {
    #[serde(default)]
    faces: Option<Vec<BoundingBox>>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_response(line: &str) -> Result<Response, ProviderError> {
    let response: Response = serde_json::from_str(line.trim())
        .map_err(|e| ProviderError::Protocol(format!("{e}: {}", line.trim())))?;
    if let Some(reason) = response.error {
        return Err(ProviderError::Rejected(reason));
    }
    Ok(response)
}

/// Provider backed by a long-running helper process.
pub struct SidecarProvider {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    frame: u64,
}

impl SidecarProvider {
    /// Spawn the helper. `command[0]` is the program, the rest its arguments.
    pub fn spawn(command: &[String]) -> Result<Self, ProviderError> {
        let display = command.join(" ");
        let (program, args) = command.split_first().ok_or_else(|| ProviderError::Spawn {
            command: display.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProviderError::Spawn {
                command: display.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(ProviderError::Exited)?;
        let stdout = child.stdout.take().ok_or(ProviderError::Exited)?;

        let command_line = &display;
        tracing::info!(command = %command_line, pid = child.id(), "face provider started");

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            frame: 0,
        })
    }

    fn send(&mut self, request: &Request<'_>, payload: Option<&[u8]>) -> Result<(), ProviderError> {
        let stdin = self.stdin.as_mut().ok_or(ProviderError::Exited)?;
        let mut line = serde_json::to_vec(request)
            .map_err(|e| ProviderError::Protocol(format!("encode request: {e}")))?;
        line.push(b'\n');
        let written = stdin
            .write_all(&line)
            .and_then(|()| payload.map_or(Ok(()), |bytes| stdin.write_all(bytes)))
            .and_then(|()| stdin.flush());
        match written {
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(ProviderError::Exited),
            other => Ok(other?),
        }
    }

    fn receive(&mut self) -> Result<Response, ProviderError> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(ProviderError::Exited);
        }
        parse_response(&line)
    }
}

impl FaceProvider for SidecarProvider {
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, ProviderError> {
        self.frame = self.frame.wrapping_add(1);
        let request = Request::Detect {
            frame: self.frame,
            width,
            height,
            bytes: frame.len(),
        };
        self.send(&request, Some(frame))?;
        self.receive()?
            .faces
            .ok_or_else(|| ProviderError::Protocol("detect response without `faces`".into()))
    }

    fn embed(
        &mut self,
        _frame: &[u8],
        _width: u32,
        _height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, ProviderError> {
        let request = Request::Embed {
            frame: self.frame,
            face,
        };
        self.send(&request, None)?;
        self.receive()?
            .embedding
            .map(Embedding::new)
            .ok_or_else(|| ProviderError::Protocol("embed response without `embedding`".into()))
    }
}

impl Drop for SidecarProvider {
    fn drop(&mut self) {
        // Closing stdin asks the helper to exit on EOF.
        drop(self.stdin.take());
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(err) = self.child.kill() {
                    tracing::debug!(error = %err, "face provider already gone");
                }
                let _ = self.child.wait();
            }
        }
        tracing::info!("face provider stopped");
    }
}
