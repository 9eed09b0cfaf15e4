//! Cellrig Process - Child process sessions and supervised groups
//!
//! This crate launches the executables under test and keeps track of them:
//!
//! - **Session**: one child process with captured stdout and stderr,
//!   signal delivery, and an exit code that is only published once all
//!   output has been captured
//! - **Group**: several sessions started in parallel or in stages, with
//!   readiness checks, fault propagation, and ordered teardown
//!
//! Sessions plug into `cellrig-poll`, so the same `eventually` and
//! `consistently` assertions work on process output and exit codes.
//!
//! # Example
//!
//! ```rust,no_run
//! use cellrig_core::{HarnessConfig, Signal};
//! use cellrig_poll::{eventually, say};
//! use cellrig_process::{Group, MemberSpec};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> cellrig_core::Result<()> {
//!     let config = HarnessConfig::local_test();
//!
//!     let group = Group::start_staged(
//!         &config,
//!         vec![
//!             MemberSpec::new("db", "./db").ready_on_output("accepting connections"),
//!             MemberSpec::new("api", "./api").ready_on_output("listening"),
//!         ],
//!     )
//!     .await?;
//!
//!     if let Some(api) = group.member("api") {
//!         eventually(api.clone()).with_config(&config).should(say("healthy")).await?;
//!     }
//!
//!     let report = group.stop(Signal::Interrupt, Duration::from_secs(10)).await?;
//!     report.check()
//! }
//! ```

pub mod group;
pub mod member;
pub mod session;
pub mod sink;

pub use group::{Group, GroupReport, GroupStyle, Member, MemberExit};
pub use member::{ExitPolicy, MemberSpec, Readiness, ReadinessProbe, TcpProbe};
pub use session::{Session, SessionSnapshot, SessionState};
pub use sink::{OutputSink, PrefixedWriter};
