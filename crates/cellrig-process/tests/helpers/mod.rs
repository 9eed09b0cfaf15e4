//! Shared fixtures for process and group integration tests

pub mod fleet;

pub use fleet::{
    crasher, init_tracing, marker_path, process_gone, read_pid, sleeper, slow_sleeper, test_config,
    SharedSink,
};
