//! Cellrig Core - Foundational types for the cellrig integration harness
//!
//! This crate provides the pieces shared by every other cellrig crate:
//! the error taxonomy, the harness configuration, the signals forwarded to
//! supervised processes, and the captured-output buffer that everything
//! else pattern-matches against.
//!
//! # Modules
//!
//! - [`buffer`] - Append-only output buffer with cursor-based detection
//! - [`pattern`] - Literal and regex patterns over bytes
//! - [`signal`] - POSIX signals the harness can forward
//! - [`config`] - Harness configuration and defaults
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust
//! use cellrig_core::{DetectState, Pattern, StreamBuffer};
//!
//! let out = StreamBuffer::new();
//! let mut started = out.detect(Pattern::regex(r"listening on \S+").unwrap());
//!
//! out.append(b"file-server listening on 127.0.0.1:8080\n").unwrap();
//! assert!(matches!(started.state(), DetectState::Matched(_)));
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod pattern;
pub mod signal;

// Re-exports for convenience
pub use buffer::{DetectState, DetectedMatch, Detector, StreamBuffer};
pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use pattern::{Pattern, PatternKind};
pub use signal::Signal;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
