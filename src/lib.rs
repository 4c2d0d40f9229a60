//! Sumi-Fetch: the URI-fetch core of a polite web crawler
//!
//! This crate decides whether a discovered URI may be fetched right now
//! (per-server, per-host and per-group quotas) and then performs the
//! wire-level HTTP retrieval, recording every byte exchanged so that
//! downstream stages can replay the request, the raw response, the
//! de-chunked entity and the decoded content independently.

pub mod config;
pub mod crawler;
pub mod recorder;
pub mod state;
pub mod url;

use thiserror::Error;

/// Main error type for Sumi-Fetch operations
///
/// These are local, fatal problems (bad configuration, unusable TLS setup).
/// Anything attributable to the remote side of a fetch is recorded on the
/// [`state::CrawlUri`] as a [`FetchFailure`] instead.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup error: {0}")]
    TlsSetup(#[from] rustls::Error),

    #[error("Invalid bind address: {0}")]
    BindAddress(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Nonfatal failures attached to a URI's result
///
/// Every variant maps the attempt to [`state::status::CONNECT_FAILED`].
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("connect to {target} timed out after {timeout_ms}ms")]
    ConnectTimeout { target: String, timeout_ms: u64 },

    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        source: std::io::Error,
    },

    #[error("invalid TLS server name: {0}")]
    TlsServerName(String),

    #[error("{target} failed to respond")]
    NoResponse { target: String },

    #[error("read from {target} timed out before response headers")]
    ResponseTimeout { target: String },

    #[error("malformed response from {target}: {message}")]
    MalformedResponse { target: String, message: String },

    #[error("proxy tunnel to {target} refused: {status_line}")]
    ProxyTunnel { target: String, status_line: String },

    #[error("SOCKS proxy error: {0}")]
    Socks(String),

    #[error("could not resolve {0}")]
    Unresolvable(String),

    #[error("content decoding failed: {0}")]
    ContentDecoding(#[from] RecorderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchFailure {
    /// Returns true if this failure is a timeout of any kind
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ResponseTimeout { .. }
        )
    }
}

/// Errors raised while replaying recorded layers
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("invalid chunk size line: {0:?}")]
    ChunkSize(String),

    #[error("{encoding} decoding failed: {source}")]
    Decode {
        encoding: String,
        source: std::io::Error,
    },
}

/// Result type alias for Sumi-Fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{FetchHttp, ProcessResult, Processor, ProcessorChain, QuotaEnforcer};
pub use recorder::Recorder;
pub use state::{CrawlUri, FetchStats, FetchType, ServerCache};
