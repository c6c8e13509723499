//! Line-delimited JSON-RPC over Unix domain sockets
//!
//! Compatible with Go's `net/rpc/jsonrpc` codec: either side of a sockexec
//! call can be replaced by a Go peer.

pub mod client;
pub mod codec;
pub mod server;

pub use client::RpcClient;
pub use server::{handle, unknown_method, RpcServer, Service};
