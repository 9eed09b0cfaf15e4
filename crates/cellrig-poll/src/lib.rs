//! Cellrig Poll - Polling assertions over asynchronous state
//!
//! Integration scenarios rarely get to assert on a value directly: a
//! scheduler places work "soon", a process prints its banner "soon". This
//! crate turns those into bounded checks:
//!
//! - [`eventually`] polls a target until a matcher accepts a sample, or
//!   fails with the last sample once the timeout expires.
//! - [`consistently`] polls a target for a fixed duration and fails on the
//!   first sample the matcher rejects.
//!
//! Targets implement [`Observe`]; matchers implement [`Matcher`]. A target
//! that knows it can no longer change (a closed buffer, an exited process)
//! makes a doomed assertion fail right away rather than at its deadline.
//!
//! # Example
//!
//! ```rust
//! use cellrig_poll::{eventually, say};
//! use cellrig_core::StreamBuffer;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cellrig_core::Result<()> {
//! let out = StreamBuffer::new();
//! out.append(b"auctioneer started\n")?;
//!
//! eventually(out.clone())
//!     .within(Duration::from_secs(1))
//!     .should(say("started"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod matcher;
pub mod observe;

pub use engine::{consistently, eventually, Consistently, Eventually};
pub use matcher::{
    be_true, contain_element, contain_substring, detected, equal, exit, exit_with, have_len,
    match_regex, not, satisfy, say, BufferSource, ExitSource, HasLen, Matcher, Verdict,
};
pub use observe::{observe_fn, value_fn, Observe, ObserveFn, Observed, ValueFn};
