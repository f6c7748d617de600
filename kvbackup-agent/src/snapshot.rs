//! Where snapshot bytes come from.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use kvbackup_common::documents::SnapshotSpec;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::BackupError;

/// Environment variable carrying the cluster endpoints to a snapshot command.
pub const ENDPOINTS_ENV: &str = "KVBACKUP_ENDPOINTS";

/// An open snapshot stream.
pub struct Snapshot {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Store revision the snapshot was taken at, when the source knows it.
    pub revision: Option<i64>,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn open(&self) -> Result<Snapshot, BackupError>;
}

pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshot {
    async fn open(&self) -> Result<Snapshot, BackupError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            BackupError::Snapshot(io::Error::new(
                e.kind(),
                format!("failed to open {}: {}", self.path.display(), e),
            ))
        })?;
        debug!(path = %self.path.display(), "Opened snapshot file");
        Ok(Snapshot {
            reader: Box::new(file),
            revision: None,
        })
    }
}

/// Runs a command and streams its stdout, e.g.
/// `etcdctl snapshot save /dev/stdout`.
pub struct CommandSnapshot {
    program: String,
    args: Vec<String>,
    endpoints: Vec<String>,
}

impl CommandSnapshot {
    pub fn new(program: impl Into<String>, args: Vec<String>, endpoints: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            endpoints,
        }
    }
}

#[async_trait]
impl SnapshotSource for CommandSnapshot {
    async fn open(&self) -> Result<Snapshot, BackupError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(ENDPOINTS_ENV, self.endpoints.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackupError::Snapshot(io::Error::new(
                    e.kind(),
                    format!("failed to spawn {}: {}", self.program, e),
                ))
            })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BackupError::Snapshot(io::Error::new(io::ErrorKind::Other, "snapshot command has no stdout"))
        })?;
        info!(program = %self.program, endpoints = self.endpoints.len(), "Started snapshot command");

        Ok(Snapshot {
            reader: Box::new(CommandStream {
                stdout,
                child,
                program: self.program.clone(),
                finished: false,
            }),
            revision: None,
        })
    }
}

/// Command stdout that only reports end-of-stream once the process has
/// exited successfully. A failing command turns EOF into a read error, so
/// a truncated snapshot is never committed.
struct CommandStream {
    stdout: ChildStdout,
    child: Child,
    program: String,
    finished: bool,
}

impl AsyncRead for CommandStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        // Child::wait is cancel safe, so a fresh future per poll is fine.
        let status = ready!(Box::pin(this.child.wait()).as_mut().poll(cx))?;
        if !status.success() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", this.program, status),
            )));
        }
        this.finished = true;
        Poll::Ready(Ok(()))
    }
}

/// Build the snapshot source a backup spec names.
pub fn from_spec(spec: &SnapshotSpec) -> Box<dyn SnapshotSource> {
    match spec {
        SnapshotSpec::File { path } => Box::new(FileSnapshot::new(path.clone())),
        SnapshotSpec::Command {
            program,
            args,
            endpoints,
        } => Box::new(CommandSnapshot::new(program.clone(), args.clone(), endpoints.clone())),
    }
}
