//! Error kinds for staging, serving and tunnelling

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Short machine-readable code for each failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareErrorCode {
    Filesystem,
    Editor,
    BinaryNotFound,
    Launch,
    Network,
    NoTunnels,
    Bind,
    Config,
}

impl ShareErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareErrorCode::Filesystem => "FILESYSTEM",
            ShareErrorCode::Editor => "EDITOR",
            ShareErrorCode::BinaryNotFound => "BINARY_NOT_FOUND",
            ShareErrorCode::Launch => "LAUNCH",
            ShareErrorCode::Network => "NETWORK",
            ShareErrorCode::NoTunnels => "NO_TUNNELS",
            ShareErrorCode::Bind => "BIND",
            ShareErrorCode::Config => "CONFIG",
        }
    }
}

#[derive(Debug, Error)]
pub enum ShareError {
    /// Copy, read or write failure while staging content
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The editor could not be launched, failed, or left an unreadable file
    #[error("editor error: {0}")]
    Editor(String),

    /// The tunnel binary is not installed or not on PATH
    #[error("{binary} not found. Please install {binary} first")]
    BinaryNotFound { binary: String },

    /// The tunnel binary exists but could not be executed
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: io::Error,
    },

    /// The tunnel status query failed on every attempt
    #[error("failed to get tunnel info from {url}: {message}")]
    Network { url: String, message: String },

    /// The status endpoint answered but listed no tunnels
    #[error("tunnel agent reported no active tunnels")]
    NoTunnels,

    /// The local server could not bind its port
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),
}

impl ShareError {
    pub fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ShareError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> ShareErrorCode {
        match self {
            ShareError::Filesystem { .. } => ShareErrorCode::Filesystem,
            ShareError::Editor(_) => ShareErrorCode::Editor,
            ShareError::BinaryNotFound { .. } => ShareErrorCode::BinaryNotFound,
            ShareError::Launch { .. } => ShareErrorCode::Launch,
            ShareError::Network { .. } => ShareErrorCode::Network,
            ShareError::NoTunnels => ShareErrorCode::NoTunnels,
            ShareError::Bind { .. } => ShareErrorCode::Bind,
            ShareError::Config(_) => ShareErrorCode::Config,
        }
    }
}

pub type Result<T, E = ShareError> = std::result::Result<T, E>;
