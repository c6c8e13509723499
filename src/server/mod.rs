//! Execution server: runs commands for callers connecting to the main socket

pub mod callbacks;
pub mod daemon;
pub mod registry;
pub mod service;

pub use daemon::{Daemon, DaemonOptions, SERVICE_NAME};
pub use registry::{Registry, Session};
pub use service::ServerService;
