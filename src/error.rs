//! Error types for the control plane and the uniform command response

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Settings could not be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Configuration store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// The base directory could not be established; the only fatal class
    #[error("cannot establish config directory {path}: {source}")]
    BaseDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error on {path} (os error {code:?}): {source}")]
    Io {
        path: PathBuf,
        code: Option<i32>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("module '{module}' has unexpected shape: {source}")]
    Shape {
        module: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("migration verification failed with {0} difference(s)")]
    MigrationMismatch(usize),
    #[error("invalid module name '{0}'")]
    InvalidModule(String),
    #[error("cannot assign through {0}")]
    InvalidPath(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            code: source.raw_os_error(),
            source,
        }
    }
}

/// Supervised-process failures
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown {kind}: {key}")]
    UnknownResource { kind: &'static str, key: String },
    #[error("{0}")]
    Invalid(String),
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("no free port available")]
    NoFreePort,
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {key}: {source}")]
    Spawn {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// DNS backend failures
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("invalid record name: {0}")]
    InvalidName(String),
    #[error("dns backend unavailable: {0}")]
    Unavailable(String),
}

/// Certificate lifecycle failures
#[derive(Debug, Error)]
pub enum CertError {
    /// ACME cannot issue certificates for bare IP addresses
    #[error("cannot issue a certificate for IP address {0}")]
    IpAddress(String),
    #[error("no website found for {0}")]
    UnknownDomain(String),
    #[error("renewal already in progress for {0}")]
    InProgress(String),
    #[error("acme: {0}")]
    Acme(String),
    #[error("certificate generation failed: {0}")]
    Generate(String),
    #[error("tls: {0}")]
    Tls(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<instant_acme::Error> for CertError {
    fn from(e: instant_acme::Error) -> Self {
        CertError::Acme(e.to_string())
    }
}

impl From<rcgen::Error> for CertError {
    fn from(e: rcgen::Error) -> Self {
        CertError::Generate(e.to_string())
    }
}

/// Response shape expected by the command dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result: bool,
    pub message: String,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            result: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            result: false,
            message: message.into(),
        }
    }

    /// Build a response from an operation result, using `success` as the message on `Ok`
    pub fn from_result<T, E: std::fmt::Display>(
        result: Result<T, E>,
        success: impl Into<String>,
    ) -> Self {
        match result {
            Ok(_) => Self::ok(success),
            Err(e) => Self::fail(e.to_string()),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"result":{},"message":"{}"}}"#,
                self.result,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}
