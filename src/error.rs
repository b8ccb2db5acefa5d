//! Error types shared by the proxy components

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern {pattern:?} in sites[{site}].{field}: {source}")]
    Pattern {
        site: usize,
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Cannot resolve remote host from {0:?}")]
    Host(String),

    #[error("Access denied")]
    Unauthorized,

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error("Rewrite failed: {0}")]
    Rewrite(String),
}

impl ProxyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
