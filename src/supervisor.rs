//! Worker process lifecycle: spawn, handshake, read loop, kill.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use testpilot_core::config::ENV_WORK_DIR;
use testpilot_core::{Envelope, EnvelopeReader, EnvelopeWriter, StreamError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const WORKER_BIN: &str = "testpilot-worker";

/// Envelopes buffered between the reader task and the dispatch loop.
const READER_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("worker entry point not found: {}", .0.display())]
    MissingEntryPoint(PathBuf),

    #[error("working directory not found: {}", .0.display())]
    MissingWorkDir(PathBuf),

    #[error("failed to open worker {0} pipe")]
    Pipe(&'static str),

    #[error("failed to start worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to send init to worker: {0}")]
    Handshake(#[source] io::Error),
}

/// Everything needed to launch the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub work_dir: PathBuf,
    /// Worker stderr goes here; discarded when `None`.
    pub log_path: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn resolve(program: Option<PathBuf>, work_dir: PathBuf, log_path: Option<PathBuf>) -> Self {
        Self {
            program: program.unwrap_or_else(default_program),
            work_dir,
            log_path,
        }
    }

    pub fn check(&self) -> Result<(), SpawnError> {
        if !self.program.is_file() {
            return Err(SpawnError::MissingEntryPoint(self.program.clone()));
        }
        if !self.work_dir.is_dir() {
            return Err(SpawnError::MissingWorkDir(self.work_dir.clone()));
        }
        Ok(())
    }

    fn stderr(&self) -> Stdio {
        let Some(path) = &self.log_path else {
            return Stdio::null();
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!("Failed to open worker log {}: {}", path.display(), e);
                Stdio::null()
            }
        }
    }
}

/// `testpilot-worker` beside the running executable.
fn default_program() -> PathBuf {
    let name = format!("{}{}", WORKER_BIN, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

pub type WorkerReader = EnvelopeReader<BufReader<ChildStdout>>;

/// One item from the worker: an envelope, or the error that ended the stream.
pub type WorkerEvent = Result<Envelope, StreamError>;

pub struct Supervisor;

impl Supervisor {
    /// Spawn the worker and write the `init` envelope. Failures are returned,
    /// never retried.
    pub async fn start(
        command: &WorkerCommand,
        api_key: &str,
    ) -> Result<(WorkerHandle, WorkerReader), SpawnError> {
        command.check()?;

        let mut child = Command::new(&command.program)
            .current_dir(&command.work_dir)
            .env(ENV_WORK_DIR, &command.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(command.stderr())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpawnError::Spawn)?;

        let stdin = child.stdin.take().ok_or(SpawnError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Pipe("stdout"))?;
        info!(pid = ?child.id(), program = %command.program.display(), "Worker started");

        let mut handle = WorkerHandle {
            child: Some(child),
            writer: EnvelopeWriter::new(Box::new(stdin)),
        };
        handle
            .send(&Envelope::init(api_key))
            .await
            .map_err(SpawnError::Handshake)?;

        Ok((handle, EnvelopeReader::new(BufReader::new(stdout))))
    }
}

/// Write side of a running worker.
pub struct WorkerHandle {
    child: Option<Child>,
    writer: EnvelopeWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl WorkerHandle {
    /// A handle with no process behind it.
    #[cfg(test)]
    pub(crate) fn detached<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> Self {
        Self {
            child: None,
            writer: EnvelopeWriter::new(Box::new(writer)),
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        debug!(kind = ?envelope.kind, "Sending to worker");
        self.writer.send(envelope).await
    }

    /// Kill the worker without draining its output.
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill worker: {}", e);
            } else {
                info!("Worker stopped");
            }
        }
    }
}

/// Move the reader into its own task. Envelopes arrive in order on the
/// returned channel; a terminal error is forwarded once and ends the task.
pub fn spawn_reader<R>(mut reader: EnvelopeReader<R>) -> (mpsc::Receiver<WorkerEvent>, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(READER_CAPACITY);
    let task = tokio::spawn(async move {
        loop {
            match reader.next_envelope().await {
                Ok(envelope) => {
                    if tx.send(Ok(envelope)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "Worker stream ended");
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });
    (rx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testpilot_core::protocol::InitPayload;
    use testpilot_core::MessageType;

    #[test]
    fn test_missing_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let command = WorkerCommand::resolve(
            Some(dir.path().join("no-such-worker")),
            dir.path().to_path_buf(),
            None,
        );
        assert!(matches!(command.check(), Err(SpawnError::MissingEntryPoint(_))));
    }

    #[test]
    fn test_missing_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("worker");
        std::fs::write(&program, "").unwrap();
        let command = WorkerCommand::resolve(Some(program), dir.path().join("gone"), None);
        assert!(matches!(command.check(), Err(SpawnError::MissingWorkDir(_))));
    }

    #[test]
    fn test_default_program_sits_beside_executable() {
        let command = WorkerCommand::resolve(None, PathBuf::from("."), None);
        let name = command.program.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(WORKER_BIN));
    }

    #[tokio::test]
    async fn test_reader_forwards_in_order_then_closes() {
        let input = format!(
            "{}\nnoise\n{}\n",
            Envelope::thinking().encode().unwrap(),
            Envelope::answer("done").encode().unwrap()
        );
        let reader = EnvelopeReader::new(BufReader::new(std::io::Cursor::new(input.into_bytes())));
        let (mut rx, task) = spawn_reader(reader);

        assert_eq!(rx.recv().await.unwrap().unwrap(), Envelope::thinking());
        assert_eq!(rx.recv().await.unwrap().unwrap(), Envelope::answer("done"));
        assert!(matches!(rx.recv().await, Some(Err(StreamError::Closed))));
        assert!(rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_sends_init_first() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("echo-worker");
        // Echo the first line back so the handshake can be observed.
        std::fs::write(&program, "#!/bin/sh\nread line\necho \"$line\"\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let command = WorkerCommand::resolve(
            Some(program),
            dir.path().to_path_buf(),
            Some(dir.path().join("logs/worker.log")),
        );
        let (mut handle, mut reader) = Supervisor::start(&command, "secret").await.unwrap();

        let echoed = reader.next_envelope().await.unwrap();
        assert_eq!(echoed.kind, MessageType::Init);
        assert_eq!(echoed.payload::<InitPayload>().api_key, "secret");
        assert!(matches!(reader.next_envelope().await, Err(StreamError::Closed)));
        assert!(dir.path().join("logs/worker.log").exists());
        handle.shutdown().await;
    }
}
