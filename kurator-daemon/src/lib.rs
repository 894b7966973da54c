//! Daemon runtime: daily scheduler + sync job processor + socket server.

mod error;
mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod schedule;

pub use error::DaemonError;
pub use protocol::{
    request_history, request_invalidate, request_status, request_stop, request_sync,
    send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, run_with_engine, start_blocking, DaemonOptions};
