//! Append-only output buffer with pattern detection
//!
//! A [`StreamBuffer`] captures everything a process writes to one of its
//! output streams. Readers never consume bytes; instead the buffer keeps a
//! read cursor that successful detections fast-forward, so repeated waits
//! for the same line do not match the same text twice.
//!
//! # Example
//!
//! ```rust
//! use cellrig_core::buffer::{DetectState, StreamBuffer};
//!
//! let buffer = StreamBuffer::new();
//! let mut detector = buffer.detect("ready");
//! assert!(matches!(detector.state(), DetectState::Pending));
//!
//! buffer.append(b"starting...\nready\n").unwrap();
//! assert!(matches!(detector.state(), DetectState::Matched(_)));
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{HarnessError, Result};
use crate::pattern::Pattern;

/// A successful detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedMatch {
    /// Absolute byte range of the match within the buffer
    pub range: Range<usize>,
    /// The matched bytes
    pub text: Vec<u8>,
}

impl DetectedMatch {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.text).into_owned()
    }
}

/// Where a [`Detector`] stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectState {
    /// Nothing matched yet and the buffer is still open
    Pending,
    /// The pattern was found
    Matched(DetectedMatch),
    /// The buffer closed without the pattern ever appearing
    Closed,
    /// The detector was released by [`StreamBuffer::cancel_detects`]
    Cancelled,
}

impl DetectState {
    /// Whether the detector can still change state
    pub fn is_pending(&self) -> bool {
        matches!(self, DetectState::Pending)
    }
}

enum Outcome {
    Matched(DetectedMatch),
    Closed,
}

struct PendingDetect {
    pattern: Pattern,
    cursor: usize,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct BufferState {
    contents: Vec<u8>,
    read_cursor: usize,
    closed: bool,
    detectors: Vec<PendingDetect>,
}

impl BufferState {
    /// Look for `pattern` from `cursor`, fast-forwarding the read cursor on success
    fn try_match(&mut self, pattern: &Pattern, cursor: usize) -> Option<DetectedMatch> {
        let start = cursor.min(self.contents.len());
        let found = pattern.find(&self.contents[start..])?;
        let range = (start + found.start)..(start + found.end);
        self.read_cursor = self.read_cursor.max(range.end);
        Some(DetectedMatch {
            text: self.contents[range.clone()].to_vec(),
            range,
        })
    }

    fn resolve_pending(&mut self) {
        let pending = std::mem::take(&mut self.detectors);
        for detect in pending {
            // Receiver dropped: nobody is waiting any more
            if detect.tx.is_closed() {
                continue;
            }
            match self.try_match(&detect.pattern, detect.cursor) {
                Some(found) => {
                    trace!(pattern = %detect.pattern, at = found.range.start, "Detector matched");
                    let _ = detect.tx.send(Outcome::Matched(found));
                }
                None => self.detectors.push(detect),
            }
        }
    }
}

/// Concurrency-safe, append-only byte log
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone, Default)]
pub struct StreamBuffer {
    inner: Arc<Mutex<BufferState>>,
}

impl StreamBuffer {
    /// Create an empty, open buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an open buffer pre-filled with `bytes`
    pub fn with_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let buffer = Self::new();
        buffer.inner.lock().contents = bytes.into();
        buffer
    }

    /// Append bytes to the tail and wake any detector they satisfy
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(HarnessError::BufferClosed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        state.contents.extend_from_slice(bytes);
        if !state.detectors.is_empty() {
            state.resolve_pending();
        }
        Ok(())
    }

    /// Snapshot of everything appended so far
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().contents.clone()
    }

    /// Contents as text, with invalid UTF-8 replaced
    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().contents).into_owned()
    }

    /// Bytes past the read cursor
    pub fn unread(&self) -> Vec<u8> {
        let state = self.inner.lock();
        state.contents[state.read_cursor..].to_vec()
    }

    pub fn read_cursor(&self) -> usize {
        self.inner.lock().read_cursor
    }

    pub fn len(&self) -> usize {
        self.inner.lock().contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of detectors still waiting
    pub fn pending_detects(&self) -> usize {
        self.inner.lock().detectors.len()
    }

    /// Watch for `pattern` from the current read cursor onwards
    ///
    /// Resolves immediately if the pattern is already there, or with
    /// [`DetectState::Closed`] if the buffer is closed and it is not.
    pub fn detect(&self, pattern: impl Into<Pattern>) -> Detector {
        let pattern = pattern.into();
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        let cursor = state.read_cursor;

        if let Some(found) = state.try_match(&pattern, cursor) {
            let _ = tx.send(Outcome::Matched(found));
        } else if state.closed {
            let _ = tx.send(Outcome::Closed);
        } else {
            state.detectors.push(PendingDetect {
                pattern: pattern.clone(),
                cursor,
                tx,
            });
        }

        Detector {
            pattern,
            rx,
            resolved: None,
        }
    }

    /// Check for `pattern` from the read cursor, fast-forwarding past it on success
    pub fn scan(&self, pattern: &Pattern) -> bool {
        let mut state = self.inner.lock();
        let cursor = state.read_cursor;
        state.try_match(pattern, cursor).is_some()
    }

    /// Release every outstanding detector without matching
    pub fn cancel_detects(&self) {
        let released = std::mem::take(&mut self.inner.lock().detectors);
        if !released.is_empty() {
            trace!(count = released.len(), "Cancelled detectors");
        }
    }

    /// Mark the buffer closed and fail every pending detector
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for detect in state.detectors.drain(..) {
            let _ = detect.tx.send(Outcome::Closed);
        }
    }
}

impl fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("StreamBuffer")
            .field("len", &state.contents.len())
            .field("read_cursor", &state.read_cursor)
            .field("closed", &state.closed)
            .field("unread", &String::from_utf8_lossy(&state.contents[state.read_cursor..]))
            .finish()
    }
}

impl io::Write for StreamBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)
            .map(|_| buf.len())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One-shot watcher created by [`StreamBuffer::detect`]
pub struct Detector {
    pattern: Pattern,
    rx: oneshot::Receiver<Outcome>,
    resolved: Option<DetectState>,
}

impl Detector {
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Current state, without blocking
    pub fn state(&mut self) -> DetectState {
        if let Some(resolved) = &self.resolved {
            return resolved.clone();
        }
        let state = match self.rx.try_recv() {
            Ok(outcome) => outcome.into(),
            Err(oneshot::error::TryRecvError::Empty) => return DetectState::Pending,
            Err(oneshot::error::TryRecvError::Closed) => DetectState::Cancelled,
        };
        self.resolved = Some(state.clone());
        state
    }

    /// Wait until the detector resolves; callers go through [`Detector::wait_timeout`]
    pub(crate) async fn wait(self) -> DetectState {
        if let Some(resolved) = self.resolved {
            return resolved;
        }
        match self.rx.await {
            Ok(outcome) => outcome.into(),
            Err(_) => DetectState::Cancelled,
        }
    }

    /// Wait for a match for at most `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> Result<DetectedMatch> {
        let description = format!("to detect {}", self.pattern);
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(DetectState::Matched(found)) => Ok(found),
            Ok(DetectState::Closed) => Err(HarnessError::DetectionClosed {
                description,
                last_value: String::new(),
                explanation: "buffer closed before the pattern appeared".to_string(),
                elapsed: started.elapsed(),
            }),
            Ok(DetectState::Cancelled) => Err(HarnessError::DetectionClosed {
                description,
                last_value: String::new(),
                explanation: "detector was cancelled".to_string(),
                elapsed: started.elapsed(),
            }),
            Ok(DetectState::Pending) | Err(_) => Err(HarnessError::timeout(description, timeout)),
        }
    }
}

impl From<Outcome> for DetectState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Matched(found) => DetectState::Matched(found),
            Outcome::Closed => DetectState::Closed,
        }
    }
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("pattern", &self.pattern)
            .field("resolved", &self.resolved)
            .finish()
    }
}
