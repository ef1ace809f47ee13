//! Error taxonomy shared by every bottle crate.

use std::path::PathBuf;
use thiserror::Error;

pub type BottleResult<T> = Result<T, BottleError>;

#[derive(Debug, Error)]
pub enum BottleError {
    /// The volume daemon rejected the supplied password or hardware-key secret.
    #[error("{operation}: wrong credential: {diagnostic}")]
    WrongCredential {
        operation: String,
        diagnostic: String,
    },

    /// The bottle is in use and the operation refuses to force it.
    #[error("{0}")]
    Busy(String),

    /// The cleartext device record outlived its kernel object.
    #[error("{operation}: {diagnostic}")]
    StaleDevice {
        operation: String,
        diagnostic: String,
    },

    #[error("required tool not available: {0}")]
    MissingTool(String),

    /// Tool succeeded but its confirmation text did not match the expected shape.
    #[error("{operation}: could not parse {expected} from tool output: {output}")]
    MalformedOutput {
        operation: String,
        expected: &'static str,
        output: String,
    },

    #[error("config corrupted at {}: {reason}", path.display())]
    CorruptedConfig { path: PathBuf, reason: String },

    /// Any other external tool failure; `diagnostic` is the tool's own text.
    #[error("{operation}: {diagnostic}")]
    Tool {
        operation: String,
        diagnostic: String,
    },

    #[error("no FIDO2 authenticator found; insert the key and try again")]
    NoAuthenticator,

    #[error("multiple FIDO2 authenticators attached ({}); select one explicitly", .0.join(", "))]
    AmbiguousAuthenticator(Vec<String>),

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("privilege escalation unavailable: {0}")]
    Privilege(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl BottleError {
    pub fn tool(operation: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        BottleError::Tool {
            operation: operation.into(),
            diagnostic: diagnostic.into(),
        }
    }

    /// True when retrying with fresh user input can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BottleError::WrongCredential { .. } | BottleError::NoAuthenticator
        )
    }

    pub fn is_wrong_credential(&self) -> bool {
        matches!(self, BottleError::WrongCredential { .. })
    }
}
