//! Process sessions
//!
//! A [`Session`] launches one child process and captures its stdout and
//! stderr into [`StreamBuffer`]s. Two pump tasks copy output as it arrives;
//! a watcher task reaps the child. The exit code only becomes visible after
//! both pumps have drained and both buffers are closed, so anything that
//! sees the exit code also sees the complete output.
//!
//! The child runs in its own process group. Signals go to the whole group,
//! which keeps shell wrappers from leaving grandchildren behind.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cellrig_core::{HarnessError, Result, Signal, StreamBuffer};
use cellrig_poll::{BufferSource, ExitSource, Observe, Observed};

use crate::sink::OutputSink;

/// Bytes read from a pipe per iteration
const PUMP_CHUNK_SIZE: usize = 4096;

/// Reported when the child could not be reaped
const WAIT_FAILED_CODE: i32 = 255;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Exited(i32),
}

impl SessionState {
    pub fn code(&self) -> Option<i32> {
        match self {
            SessionState::Running => None,
            SessionState::Exited(code) => Some(*code),
        }
    }
}

struct SessionInner {
    pid: Option<u32>,
    command_line: String,
    out: StreamBuffer,
    err: StreamBuffer,
    exit_rx: watch::Receiver<Option<i32>>,
}

/// Handle to a running (or finished) child process
///
/// Cloning is cheap; all clones observe the same process.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Launch `command` with piped stdout and stderr
    ///
    /// Each captured chunk is also written to the matching sink, if any.
    /// Must be called from within a tokio runtime.
    pub fn start(
        mut command: Command,
        out_sink: Option<Box<dyn OutputSink>>,
        err_sink: Option<Box<dyn OutputSink>>,
    ) -> Result<Self> {
        let command_line = describe(&command);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id();

        let out = StreamBuffer::new();
        let err = StreamBuffer::new();
        let out_pump = tokio::spawn(pump(child.stdout.take(), out.clone(), out_sink));
        let err_pump = tokio::spawn(pump(child.stderr.take(), err.clone(), err_sink));

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(
            child,
            [out_pump, err_pump],
            [out.clone(), err.clone()],
            exit_tx,
        ));

        info!(pid = ?pid, command = %command_line, "Started process");

        Ok(Self {
            inner: Arc::new(SessionInner {
                pid,
                command_line,
                out,
                err,
                exit_rx,
            }),
        })
    }

    /// OS process id
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Program and arguments, space separated
    pub fn command_line(&self) -> &str {
        &self.inner.command_line
    }

    /// Captured stdout
    pub fn out(&self) -> &StreamBuffer {
        &self.inner.out
    }

    /// Captured stderr
    pub fn err(&self) -> &StreamBuffer {
        &self.inner.err
    }

    /// Exit code, or -1 while the process is running
    ///
    /// A process killed by a signal reports 128 plus the signal number.
    pub fn exit_code(&self) -> i32 {
        self.inner.exit_rx.borrow().unwrap_or(-1)
    }

    pub fn state(&self) -> SessionState {
        match *self.inner.exit_rx.borrow() {
            Some(code) => SessionState::Exited(code),
            None => SessionState::Running,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exit_rx.borrow().is_some()
    }

    /// Resolve once the exit code is published
    ///
    /// No deadline; only for racing inside the crate's own `select!` loops.
    pub(crate) async fn exited(&self) -> i32 {
        let mut rx = self.inner.exit_rx.clone();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        };
        code.unwrap_or(WAIT_FAILED_CODE)
    }

    /// Wait up to `timeout` for the process to exit and return its code
    pub async fn wait(&self, timeout: Duration) -> Result<i32> {
        tokio::time::timeout(timeout, self.exited())
            .await
            .map_err(|_| {
                HarnessError::timeout(format!("waiting for `{}` to exit", self.command_line()), timeout)
            })
    }

    /// Deliver `signal` to the process group
    ///
    /// Does nothing once the process has exited. A process that vanished
    /// between the check and the delivery is not an error.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.inner.pid else {
            return Ok(());
        };
        if self.has_exited() {
            debug!(pid, %signal, "Process already exited, not signalling");
            return Ok(());
        }

        debug!(pid, %signal, "Signalling process group");
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal.as_raw()) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(HarnessError::Signal {
            pid,
            signal,
            reason: err.to_string(),
        })
    }

    pub fn interrupt(&self) -> Result<()> {
        self.signal(Signal::Interrupt)
    }

    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::Terminate)
    }

    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::Kill)
    }

    /// Send SIGTERM and wait for the exit code
    pub async fn terminate_and_wait(&self, timeout: Duration) -> Result<i32> {
        self.terminate()?;
        self.wait(timeout).await
    }

    /// Send SIGKILL and wait for the exit code
    pub async fn kill_and_wait(&self, timeout: Duration) -> Result<i32> {
        self.kill()?;
        self.wait(timeout).await
    }

    /// Point-in-time view for matchers
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            out: self.inner.out.clone(),
            err: self.inner.err.clone(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.inner.pid)
            .field("command", &self.inner.command_line)
            .field("state", &self.state())
            .finish()
    }
}

impl BufferSource for Session {
    fn buffer(&self) -> &StreamBuffer {
        &self.inner.out
    }
}

impl ExitSource for Session {
    fn exit_code(&self) -> Option<i32> {
        self.state().code()
    }
}

/// Session state sampled by the assertion engine
///
/// `say` matches against `out`; `exit` and `exit_with` against `state`.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub out: StreamBuffer,
    pub err: StreamBuffer,
}

impl BufferSource for SessionSnapshot {
    fn buffer(&self) -> &StreamBuffer {
        &self.out
    }
}

impl ExitSource for SessionSnapshot {
    fn exit_code(&self) -> Option<i32> {
        self.state.code()
    }
}

#[async_trait]
impl Observe for Session {
    type Output = SessionSnapshot;

    async fn observe(&mut self) -> Result<Observed<SessionSnapshot>> {
        let snapshot = self.snapshot();
        Ok(match snapshot.state {
            SessionState::Running => Observed::open(snapshot),
            SessionState::Exited(code) => {
                Observed::settled(snapshot, format!("process exited with code {}", code))
            }
        })
    }
}

fn describe(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(WAIT_FAILED_CODE)
}

async fn pump<R>(reader: Option<R>, buffer: StreamBuffer, mut sink: Option<Box<dyn OutputSink>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        buffer.close();
        return;
    };

    let mut chunk = vec![0u8; PUMP_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Output read failed: {}", e);
                break;
            }
        };
        let bytes = &chunk[..n];

        // Keep draining a buffer someone closed early so the child never blocks on a full pipe
        if buffer.append(bytes).is_err() {
            debug!("Dropping {} bytes for closed buffer", n);
        }

        if let Some(out) = sink.as_mut() {
            if let Err(e) = out.write_chunk(bytes).and_then(|_| out.flush_sink()) {
                warn!("Output mirror failed, disabling it: {}", e);
                sink = None;
            }
        }
    }

    buffer.close();
}

async fn watch_exit(
    mut child: Child,
    pumps: [JoinHandle<()>; 2],
    buffers: [StreamBuffer; 2],
    exit_tx: watch::Sender<Option<i32>>,
) {
    let pid = child.id();
    let code = match child.wait().await {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!(pid = ?pid, "Failed to reap process: {}", e);
            WAIT_FAILED_CODE
        }
    };

    for pump in pumps {
        if let Err(e) = pump.await {
            warn!(pid = ?pid, "Output pump panicked: {}", e);
        }
    }
    for buffer in buffers {
        buffer.close();
    }

    info!(pid = ?pid, code, "Process exited");
    exit_tx.send_replace(Some(code));
}
