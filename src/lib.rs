//! Remote command execution over Unix domain sockets
//!
//! `sockexecd` listens on `<root>/<name>.sock` and runs commands on behalf of
//! `sockexec` clients. Each call streams the child's output back line by line
//! and pulls stdin on demand through three per-call callback sockets that the
//! client serves under `<root>/<machine_id>/`.

pub mod cancel;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod resolver;
pub mod rpc;
pub mod server;
pub mod signal;
