//! Ownership wrapper around one spawned dev-loop process.
//!
//! The handle exposes a single bounded, ordered event channel per process
//! (spawned, output chunks, exited) plus best-effort signal delivery. The
//! underlying OS process has its own lifetime: dropping the handle does
//! not kill it, termination always requires an explicit signal.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::DevLoopError;
use crate::error::Result;

const READ_CHUNK_SIZE: usize = 8192; // bytes per read
/// Depth of the per-process event channel. Readers apply backpressure once
/// the consumer falls this far behind instead of buffering without bound.
const EVENT_CHANNEL_CAPACITY: usize = 256;
const KILL_CHANNEL_CAPACITY: usize = 4;

#[cfg(unix)]
const EXIT_CODE_SIGNAL_BASE: i32 = 128; // conventional shell: 128 + signal

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Graceful: what Ctrl-C in the dev loop's own terminal would deliver.
    /// The process may run remote cleanup before exiting.
    Interrupt,
    /// Forceful, immediate termination.
    Abort,
}

/// Lifecycle events of one spawned process, delivered in order on a single
/// channel: `Spawned` exactly once and first, `Output` until exit, `Exited`
/// exactly once and last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned {
        pid: u32,
    },
    Output {
        stream: OutputStream,
        chunk: Vec<u8>,
    },
    Exited {
        code: Option<i32>,
    },
}

#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    kill_tx: mpsc::Sender<SignalKind>,
}

impl ProcessHandle {
    /// Launches `program` with `args` in `cwd`, stdout/stderr piped, stdin
    /// closed. Returns the handle and the event channel receiver.
    pub async fn spawn(
        program: &Path,
        args: &[String],
        cwd: &Path,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>)> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        set_parent_death(&mut command);

        let mut child = command
            .spawn()
            .map_err(|source| DevLoopError::spawn(program.display().to_string(), source))?;
        let pid = child.id().ok_or_else(|| {
            DevLoopError::spawn(
                program.display().to_string(),
                std::io::Error::other("process exited before a pid was assigned"),
            )
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            DevLoopError::spawn(
                program.display().to_string(),
                std::io::Error::other("stdout pipe was unexpectedly not available"),
            )
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            DevLoopError::spawn(
                program.display().to_string(),
                std::io::Error::other("stderr pipe was unexpectedly not available"),
            )
        })?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = mpsc::channel(KILL_CHANNEL_CAPACITY);

        // Emitted before the readers start so consumers always observe
        // Spawned first. The channel is fresh, so this cannot fail.
        let _ = event_tx.try_send(ProcessEvent::Spawned { pid });

        let readers = vec![
            tokio::spawn(read_stream(
                BufReader::new(stdout),
                OutputStream::Stdout,
                event_tx.clone(),
            )),
            tokio::spawn(read_stream(
                BufReader::new(stderr),
                OutputStream::Stderr,
                event_tx.clone(),
            )),
        ];
        tokio::spawn(supervise_exit(child, pid, kill_rx, event_tx, readers));

        Ok((Self { pid, kill_tx }, event_rx))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Best-effort signal delivery. Fails with `SignalDelivery` once the
    /// process has exited; callers treat that as a harmless race.
    pub async fn signal(&self, kind: SignalKind) -> Result<()> {
        self.kill_tx
            .send(kind)
            .await
            .map_err(|_| DevLoopError::SignalDelivery)
    }
}

async fn read_stream<R>(mut reader: R, stream: OutputStream, events: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                if events
                    .send(ProcessEvent::Output { stream, chunk })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                // Stream errors never affect session state.
                warn!(?stream, error = %err, "dev loop output stream error");
                break;
            }
        }
    }
}

/// Owns the child: delivers requested signals and reaps the exit status.
/// The kill channel is closed before `Exited` is emitted, so a signal sent
/// after observing the exit event deterministically fails.
async fn supervise_exit(
    mut child: Child,
    pid: u32,
    mut kill_rx: mpsc::Receiver<SignalKind>,
    events: mpsc::Sender<ProcessEvent>,
    readers: Vec<JoinHandle<()>>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv() => match request {
                Some(kind) => deliver_signal(&mut child, pid, kind),
                None => break child.wait().await,
            },
        }
    };
    kill_rx.close();
    drop(kill_rx);

    // Pipes hit EOF once the process is gone; wait for the tail so output
    // ordering holds and Exited is the last event.
    for reader in readers {
        let _ = reader.await;
    }

    let code = match status {
        Ok(status) => exit_code(status),
        Err(err) => {
            warn!(pid, error = %err, "failed to reap dev loop process");
            None
        }
    };
    debug!(pid, ?code, "dev loop process exited");
    let _ = events.send(ProcessEvent::Exited { code }).await;
}

fn deliver_signal(child: &mut Child, pid: u32, kind: SignalKind) {
    match kind {
        SignalKind::Interrupt => {
            #[cfg(unix)]
            {
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
                if rc != 0 {
                    warn!(pid, "failed to deliver SIGINT to dev loop");
                }
            }
            #[cfg(not(unix))]
            {
                // No graceful interrupt on this platform; fall back to a
                // hard kill.
                if let Err(err) = child.start_kill() {
                    warn!(pid, error = %err, "failed to kill dev loop");
                }
            }
        }
        SignalKind::Abort => {
            if let Err(err) = child.start_kill() {
                warn!(pid, error = %err, "failed to deliver kill to dev loop");
            }
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| EXIT_CODE_SIGNAL_BASE + signal))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// Sets a parent-death signal so a crashed supervisor cannot silently
/// orphan dev loops. If the original parent died between fork and this
/// call, the child terminates itself immediately.
#[cfg(target_os = "linux")]
fn set_parent_death(command: &mut Command) {
    let parent_pid = unsafe { libc::getpid() };
    unsafe {
        command.pre_exec(move || {
            // Ignore errors for portability.
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            if libc::getppid() != parent_pid {
                libc::kill(libc::getpid(), libc::SIGTERM);
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death(_command: &mut Command) {
    // No parent-death signal on non-Linux platforms.
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn sh_args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    async fn next_event(events: &mut mpsc::Receiver<ProcessEvent>) -> ProcessEvent {
        timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for process event")
            .expect("event channel closed early")
    }

    #[tokio::test]
    async fn events_arrive_spawned_then_output_then_exited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_handle, mut events) =
            ProcessHandle::spawn(Path::new("/bin/sh"), &sh_args("printf hi"), dir.path())
                .await
                .expect("spawn");

        assert_matches!(next_event(&mut events).await, ProcessEvent::Spawned { pid } if pid > 0);

        let mut stdout = Vec::new();
        loop {
            match next_event(&mut events).await {
                ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    chunk,
                } => stdout.extend_from_slice(&chunk),
                ProcessEvent::Output { .. } => {}
                ProcessEvent::Exited { code } => {
                    assert_eq!(code, Some(0));
                    break;
                }
                ProcessEvent::Spawned { .. } => panic!("spawned delivered twice"),
            }
        }
        assert_eq!(String::from_utf8_lossy(&stdout), "hi");
    }

    /// Waits until the script reports that its trap is installed, so the
    /// signal cannot race sh startup.
    async fn wait_for_output(events: &mut mpsc::Receiver<ProcessEvent>, marker: &str) {
        let mut seen = String::new();
        loop {
            if let ProcessEvent::Output { chunk, .. } = next_event(events).await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains(marker) {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn interrupt_terminates_a_cooperating_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = "trap 'exit 0' INT; echo armed; while :; do sleep 0.05; done";
        let (handle, mut events) =
            ProcessHandle::spawn(Path::new("/bin/sh"), &sh_args(script), dir.path())
                .await
                .expect("spawn");

        assert_matches!(next_event(&mut events).await, ProcessEvent::Spawned { .. });
        wait_for_output(&mut events, "armed").await;
        handle.signal(SignalKind::Interrupt).await.expect("signal");

        loop {
            match next_event(&mut events).await {
                ProcessEvent::Exited { code } => {
                    assert_eq!(code, Some(0));
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn abort_kills_a_process_that_ignores_interrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = "trap '' INT; echo armed; while :; do sleep 0.05; done";
        let (handle, mut events) =
            ProcessHandle::spawn(Path::new("/bin/sh"), &sh_args(script), dir.path())
                .await
                .expect("spawn");

        assert_matches!(next_event(&mut events).await, ProcessEvent::Spawned { .. });
        wait_for_output(&mut events, "armed").await;
        handle.signal(SignalKind::Interrupt).await.expect("signal");
        handle.signal(SignalKind::Abort).await.expect("signal");

        loop {
            match next_event(&mut events).await {
                ProcessEvent::Exited { code } => {
                    // killed by SIGKILL: 128 + 9
                    assert_eq!(code, Some(137));
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn signal_after_exit_reports_delivery_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, mut events) =
            ProcessHandle::spawn(Path::new("/bin/sh"), &sh_args("exit 3"), dir.path())
                .await
                .expect("spawn");

        loop {
            match next_event(&mut events).await {
                ProcessEvent::Exited { code } => {
                    assert_eq!(code, Some(3));
                    break;
                }
                _ => {}
            }
        }

        assert_matches!(
            handle.signal(SignalKind::Interrupt).await,
            Err(DevLoopError::SignalDelivery)
        );
    }

    #[tokio::test]
    async fn spawn_of_a_missing_executable_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = Path::new("/nonexistent/devloop-test-binary");
        let result = ProcessHandle::spawn(missing, &[], dir.path()).await;
        assert_matches!(result, Err(DevLoopError::Spawn { .. }));
    }
}
