//! Matchers evaluated against observed values
//!
//! A [`Matcher`] answers one question about a sample: does it match, does
//! it not match yet, or can it never match again. The third answer is what
//! lets a doomed assertion fail as soon as its target closes.

use std::collections::HashMap;
use std::fmt::Debug;

use cellrig_core::{DetectState, Pattern, Result, StreamBuffer};

/// Most unread bytes quoted in a failure explanation
const MAX_QUOTED_BYTES: usize = 512;

/// Outcome of evaluating one sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The sample satisfies the matcher
    Match,
    /// Not yet; a later sample might
    Miss(String),
    /// No future sample can match
    Closed(String),
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }

    fn from_bool(matched: bool, explain: impl FnOnce() -> String) -> Self {
        if matched {
            Verdict::Match
        } else {
            Verdict::Miss(explain())
        }
    }
}

/// Evaluates samples of type `T`
pub trait Matcher<T: ?Sized>: Send + Sync {
    fn evaluate(&self, actual: &T) -> Verdict;

    /// What the matcher expects, e.g. `to equal 3`
    fn describe(&self) -> String;
}

/// Values that expose a captured output buffer
pub trait BufferSource {
    fn buffer(&self) -> &StreamBuffer;
}

impl BufferSource for StreamBuffer {
    fn buffer(&self) -> &StreamBuffer {
        self
    }
}

/// Values that can report a process exit code
pub trait ExitSource {
    /// `None` while the process is still running
    fn exit_code(&self) -> Option<i32>;
}

/// Values with a length
pub trait HasLen {
    fn length(&self) -> usize;
}

impl<T> HasLen for Vec<T> {
    fn length(&self) -> usize {
        self.len()
    }
}

impl<T> HasLen for [T] {
    fn length(&self) -> usize {
        self.len()
    }
}

impl HasLen for String {
    fn length(&self) -> usize {
        self.len()
    }
}

impl HasLen for str {
    fn length(&self) -> usize {
        self.len()
    }
}

impl<K, V> HasLen for HashMap<K, V> {
    fn length(&self) -> usize {
        self.len()
    }
}

// ============================================================================
// Value matchers
// ============================================================================

/// Matches values equal to the expected one
#[derive(Debug, Clone)]
pub struct Equal<E>(E);

pub fn equal<E: Debug + Send + Sync>(expected: E) -> Equal<E> {
    Equal(expected)
}

impl<T, E> Matcher<T> for Equal<E>
where
    T: PartialEq<E> + Debug + ?Sized,
    E: Debug + Send + Sync,
{
    fn evaluate(&self, actual: &T) -> Verdict {
        Verdict::from_bool(actual == &self.0, || {
            format!("{:?} is not equal to {:?}", actual, self.0)
        })
    }

    fn describe(&self) -> String {
        format!("to equal {:?}", self.0)
    }
}

/// Matches collections containing an element
#[derive(Debug, Clone)]
pub struct ContainElement<E>(E);

pub fn contain_element<E: Debug + Send + Sync>(element: E) -> ContainElement<E> {
    ContainElement(element)
}

impl<T, E> Matcher<Vec<T>> for ContainElement<E>
where
    T: PartialEq<E> + Debug,
    E: Debug + Send + Sync,
{
    fn evaluate(&self, actual: &Vec<T>) -> Verdict {
        Verdict::from_bool(actual.iter().any(|item| item == &self.0), || {
            format!("{:?} does not contain {:?}", actual, self.0)
        })
    }

    fn describe(&self) -> String {
        format!("to contain element {:?}", self.0)
    }
}

/// Matches values of a given length
#[derive(Debug, Clone, Copy)]
pub struct HaveLen(usize);

pub fn have_len(len: usize) -> HaveLen {
    HaveLen(len)
}

impl<T: HasLen + ?Sized> Matcher<T> for HaveLen {
    fn evaluate(&self, actual: &T) -> Verdict {
        let len = actual.length();
        Verdict::from_bool(len == self.0, || format!("length is {}", len))
    }

    fn describe(&self) -> String {
        format!("to have length {}", self.0)
    }
}

/// Matches strings containing a substring
#[derive(Debug, Clone)]
pub struct ContainSubstring(String);

pub fn contain_substring(needle: impl Into<String>) -> ContainSubstring {
    ContainSubstring(needle.into())
}

impl<T: AsRef<str> + ?Sized> Matcher<T> for ContainSubstring {
    fn evaluate(&self, actual: &T) -> Verdict {
        let actual = actual.as_ref();
        Verdict::from_bool(actual.contains(&self.0), || {
            format!("{:?} does not contain {:?}", actual, self.0)
        })
    }

    fn describe(&self) -> String {
        format!("to contain substring {:?}", self.0)
    }
}

/// Matches strings against a regular expression
#[derive(Debug, Clone)]
pub struct MatchRegex(Pattern);

pub fn match_regex(expr: &str) -> Result<MatchRegex> {
    Pattern::regex(expr).map(MatchRegex)
}

impl<T: AsRef<str> + ?Sized> Matcher<T> for MatchRegex {
    fn evaluate(&self, actual: &T) -> Verdict {
        let actual = actual.as_ref();
        Verdict::from_bool(self.0.is_match(actual.as_bytes()), || {
            format!("{:?} does not match {}", actual, self.0)
        })
    }

    fn describe(&self) -> String {
        format!("to match regex {}", self.0)
    }
}

/// Matches `true`
#[derive(Debug, Clone, Copy)]
pub struct BeTrue;

pub fn be_true() -> BeTrue {
    BeTrue
}

impl Matcher<bool> for BeTrue {
    fn evaluate(&self, actual: &bool) -> Verdict {
        Verdict::from_bool(*actual, || "got false".to_string())
    }

    fn describe(&self) -> String {
        "to be true".to_string()
    }
}

/// Matches values accepted by a predicate
pub struct Satisfy<F> {
    description: String,
    predicate: F,
}

pub fn satisfy<T, F>(description: impl Into<String>, predicate: F) -> Satisfy<F>
where
    T: ?Sized,
    F: Fn(&T) -> bool + Send + Sync,
{
    Satisfy {
        description: description.into(),
        predicate,
    }
}

impl<T, F> Matcher<T> for Satisfy<F>
where
    T: Debug + ?Sized,
    F: Fn(&T) -> bool + Send + Sync,
{
    fn evaluate(&self, actual: &T) -> Verdict {
        Verdict::from_bool((self.predicate)(actual), || {
            format!("{:?} does not satisfy {}", actual, self.description)
        })
    }

    fn describe(&self) -> String {
        format!("to satisfy {}", self.description)
    }
}

/// Inverts another matcher
#[derive(Debug, Clone)]
pub struct Not<M>(M);

pub fn not<M>(matcher: M) -> Not<M> {
    Not(matcher)
}

impl<T: ?Sized, M: Matcher<T>> Matcher<T> for Not<M> {
    fn evaluate(&self, actual: &T) -> Verdict {
        match self.0.evaluate(actual) {
            Verdict::Match => Verdict::Miss(format!("unexpectedly matched: {}", self.0.describe())),
            // The inner matcher is done for good, so its negation always holds
            Verdict::Miss(_) | Verdict::Closed(_) => Verdict::Match,
        }
    }

    fn describe(&self) -> String {
        format!("not {}", self.0.describe())
    }
}

// ============================================================================
// Output and process matchers
// ============================================================================

/// Matches when a buffer shows a pattern past its read cursor
///
/// A match fast-forwards the buffer's read cursor, so saying the same
/// thing twice needs it to appear twice.
#[derive(Debug, Clone)]
pub struct Say(Pattern);

pub fn say(pattern: impl Into<Pattern>) -> Say {
    Say(pattern.into())
}

impl<T: BufferSource + ?Sized> Matcher<T> for Say {
    fn evaluate(&self, actual: &T) -> Verdict {
        let buffer = actual.buffer();
        // Sample the flag first: if it was closed, every byte is already there
        let closed = buffer.closed();
        if buffer.scan(&self.0) {
            return Verdict::Match;
        }
        let unread = quote_unread(buffer);
        if closed {
            Verdict::Closed(format!("buffer closed without {}; unread: {}", self.0, unread))
        } else {
            Verdict::Miss(format!("no {} yet; unread: {}", self.0, unread))
        }
    }

    fn describe(&self) -> String {
        format!("to say {}", self.0)
    }
}

fn quote_unread(buffer: &StreamBuffer) -> String {
    let unread = buffer.unread();
    let tail = &unread[unread.len().saturating_sub(MAX_QUOTED_BYTES)..];
    let prefix = if tail.len() < unread.len() { "..." } else { "" };
    format!("{}{:?}", prefix, String::from_utf8_lossy(tail))
}

/// Matches exited processes, optionally with a specific code
#[derive(Debug, Clone, Copy)]
pub struct Exit(Option<i32>);

/// Any exit code
pub fn exit() -> Exit {
    Exit(None)
}

/// A specific exit code
pub fn exit_with(code: i32) -> Exit {
    Exit(Some(code))
}

impl<T: ExitSource + ?Sized> Matcher<T> for Exit {
    fn evaluate(&self, actual: &T) -> Verdict {
        match (actual.exit_code(), self.0) {
            (None, _) => Verdict::Miss("process is still running".to_string()),
            (Some(_), None) => Verdict::Match,
            (Some(code), Some(expected)) if code == expected => Verdict::Match,
            (Some(code), Some(expected)) => {
                Verdict::Closed(format!("exited with code {}, expected {}", code, expected))
            }
        }
    }

    fn describe(&self) -> String {
        match self.0 {
            Some(code) => format!("to exit with code {}", code),
            None => "to exit".to_string(),
        }
    }
}

/// Matches a detector that found its pattern
#[derive(Debug, Clone, Copy)]
pub struct Detected;

pub fn detected() -> Detected {
    Detected
}

impl Matcher<DetectState> for Detected {
    fn evaluate(&self, actual: &DetectState) -> Verdict {
        match actual {
            DetectState::Matched(_) => Verdict::Match,
            DetectState::Pending => Verdict::Miss("pattern not seen yet".to_string()),
            DetectState::Closed => Verdict::Closed("buffer closed without a match".to_string()),
            DetectState::Cancelled => Verdict::Closed("detector was cancelled".to_string()),
        }
    }

    fn describe(&self) -> String {
        "to detect its pattern".to_string()
    }
}
