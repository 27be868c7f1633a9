//! Tunshare - share local content through a public tunnel
//!
//! This library:
//! - Stages text, a single file, or a directory tree into a fresh temp directory
//! - Serves that directory over plain HTTP on a local port
//! - Launches a tunnel agent (ngrok by default) for the port and reads the
//!   assigned public URLs from its local status API
//! - Tears everything down exactly once on SIGINT/SIGTERM

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod server;
pub mod stage;
pub mod tunnel;
