//! Common error types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Reading or writing a sysfs attribute failed
    #[error("sysfs access to {} failed: {source}", path.display())]
    Sysfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Attribute content could not be interpreted
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// Device is missing a required property
    #[error("invalid device {bus_id}: {message}")]
    Validation { bus_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn sysfs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Sysfs {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True when the underlying file or directory does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Sysfs { source, .. } | Self::Io(source) => {
                source.kind() == io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
