//! Fleet fixtures - small shell programs that behave like services
//!
//! Every long-running fixture `exec`s its final command so signals reach
//! the program that owns the output pipes.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use cellrig_core::HarnessConfig;
use cellrig_process::MemberSpec;

/// Process-unique counter for marker files
static MARKER_COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cellrig_process=debug,cellrig_poll=debug")
        .with_test_writer()
        .try_init();
}

/// Short timeouts suitable for local processes
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        poll_interval_ms: 10,
        readiness_timeout_ms: 2000,
        teardown_grace_ms: 2000,
        ..HarnessConfig::local_test()
    }
}

/// Member that announces itself and then sleeps until signalled
pub fn sleeper(name: &str) -> MemberSpec {
    MemberSpec::shell(name, format!("echo {} started; exec sleep 30", name))
        .ready_on_output(format!("{} started", name))
}

/// Member that exits with `code` after `delay` seconds
pub fn crasher(name: &str, code: i32, delay: &str) -> MemberSpec {
    MemberSpec::shell(name, format!("sleep {}; echo {} crashing >&2; exit {}", delay, name, code))
}

/// Member that writes its pid to `pid_file`, announces itself after
/// `delay` seconds and then sleeps until signalled
pub fn slow_sleeper(name: &str, delay: &str, pid_file: &Path) -> MemberSpec {
    MemberSpec::shell(
        name,
        format!(
            "echo $$ > {}; sleep {}; echo {} started; exec sleep 30",
            pid_file.display(),
            delay,
            name
        ),
    )
    .ready_on_output(format!("{} started", name))
}

/// Pid a fixture wrote with `echo $$`
pub fn read_pid(pid_file: &Path) -> i32 {
    let text = std::fs::read_to_string(pid_file).expect("pid file written");
    let _ = std::fs::remove_file(pid_file);
    text.trim().parse().expect("pid file holds a pid")
}

/// Whether `pid` no longer names a process
pub fn process_gone(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence
    let rc = unsafe { libc::kill(pid, 0) };
    rc == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

/// Fresh path in the temp dir that does not exist yet
pub fn marker_path(tag: &str) -> PathBuf {
    let n = MARKER_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("cellrig-{}-{}-{}", tag, std::process::id(), n));
    let _ = std::fs::remove_file(&path);
    path
}

/// Output sink whose bytes stay readable after it is handed to a session
#[derive(Clone, Default)]
pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
