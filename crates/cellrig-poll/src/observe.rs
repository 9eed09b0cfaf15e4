//! Observation targets
//!
//! Anything that can produce a current value implements [`Observe`].
//! Targets that know they can no longer change mark their sample as
//! settled, which lets the engine stop polling instead of waiting out the
//! full timeout.

use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;

use cellrig_core::{DetectState, Detector, Result, StreamBuffer};

/// One sample taken from an observation target
#[derive(Debug, Clone)]
pub struct Observed<T> {
    /// The sampled value
    pub value: T,
    /// Why the target can no longer change, if it can't
    pub settled: Option<String>,
}

impl<T> Observed<T> {
    /// A sample from a target that may still change
    pub fn open(value: T) -> Self {
        Self {
            value,
            settled: None,
        }
    }

    /// A sample from a target that is done changing
    pub fn settled(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            settled: Some(reason.into()),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.is_some()
    }
}

/// Produces a current value on demand
///
/// Returning an error is terminal: the engine stops polling and reports
/// [`cellrig_core::HarnessError::ObservationFailed`].
#[async_trait]
pub trait Observe: Send {
    type Output: Debug + Send;

    async fn observe(&mut self) -> Result<Observed<Self::Output>>;
}

/// Observation backed by an async, fallible closure
pub struct ObserveFn<F>(F);

/// Observe through an async closure, e.g. a call to an external store client
///
/// ```rust,ignore
/// let cells = observe_fn(|| async { client.cells().await.map_err(into_harness) });
/// eventually(cells).should(have_len(1)).await?;
/// ```
pub fn observe_fn<F, Fut, T>(f: F) -> ObserveFn<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Debug + Send,
{
    ObserveFn(f)
}

#[async_trait]
impl<F, Fut, T> Observe for ObserveFn<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Debug + Send,
{
    type Output = T;

    async fn observe(&mut self) -> Result<Observed<T>> {
        (self.0)().await.map(Observed::open)
    }
}

/// Observation backed by a plain closure
pub struct ValueFn<F>(F);

/// Observe through a synchronous, infallible closure
pub fn value_fn<F, T>(f: F) -> ValueFn<F>
where
    F: FnMut() -> T + Send,
    T: Debug + Send,
{
    ValueFn(f)
}

#[async_trait]
impl<F, T> Observe for ValueFn<F>
where
    F: FnMut() -> T + Send,
    T: Debug + Send,
{
    type Output = T;

    async fn observe(&mut self) -> Result<Observed<T>> {
        Ok(Observed::open((self.0)()))
    }
}

#[async_trait]
impl Observe for StreamBuffer {
    type Output = StreamBuffer;

    async fn observe(&mut self) -> Result<Observed<StreamBuffer>> {
        let sample = self.clone();
        if self.closed() {
            Ok(Observed::settled(sample, "buffer closed"))
        } else {
            Ok(Observed::open(sample))
        }
    }
}

#[async_trait]
impl Observe for Detector {
    type Output = DetectState;

    async fn observe(&mut self) -> Result<Observed<DetectState>> {
        Ok(match self.state() {
            DetectState::Pending => Observed::open(DetectState::Pending),
            DetectState::Closed => Observed::settled(DetectState::Closed, "buffer closed without a match"),
            DetectState::Cancelled => Observed::settled(DetectState::Cancelled, "detector cancelled"),
            matched => Observed::settled(matched, "detector matched"),
        })
    }
}
