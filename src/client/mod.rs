//! Execution client: asks a server to run one command and relays its I/O

pub mod services;
pub mod session;
pub mod sink;

pub use services::StdinSource;
pub use session::{run_call, send_cancel, CallOptions, CallOutcome};
pub use sink::ReorderSink;
