use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// The message shown for both corrupt and unauthentic containers. The two
/// are never told apart in user-visible text.
pub const UNAUTHENTIC_MESSAGE: &str = "corrupt input, tampered-with data, or bad passphrase";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// In particular this means that use of Internal is never a guarantee
    /// the error is not, for example due to a user error - merely that it
    /// cannot be confidently determined by the code.
    Internal,

    /// The user provided invalid input or performed an action that is
    /// unsupported or impossible to complete.
    User,
}

/// The failure taxonomy surfaced to callers of the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad paths, an empty passphrase or an invalid configuration value.
    InvalidInput,
    /// The passphrase cannot be used for key derivation.
    InvalidPassphrase,
    /// Input is not a container, or uses a format version we do not know.
    UnsupportedFormat,
    /// The container is truncated, has inconsistent lengths, or trailing data.
    CorruptContainer,
    /// Authentication failed due to an incorrect passphrase or tampering
    /// or corruption.
    AuthenticationFailure,
    /// Interaction with the filesystem or another OS facility failed.
    Io,
    /// The caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// Category used when an error of this kind is created without one.
    pub fn default_category(self) -> ErrorCategory {
        match self {
            ErrorKind::Io => ErrorCategory::Internal,
            _ => ErrorCategory::User,
        }
    }

    /// Process exit code used by the command line front end.
    ///
    /// Corrupt and unauthentic containers deliberately share a code.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidInput | ErrorKind::InvalidPassphrase => 2,
            ErrorKind::UnsupportedFormat => 3,
            ErrorKind::CorruptContainer | ErrorKind::AuthenticationFailure => 4,
            ErrorKind::Io => 5,
            ErrorKind::Cancelled => 130,
        }
    }
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct VaultError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Specific condition tag from the failure taxonomy.
    pub kind: ErrorKind,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl VaultError {
    /// Creates a new error of the given kind, using the kind's default category.
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category: kind.default_category(),
            kind,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error with an explicit category.
    pub fn with_category(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that retains the originating source error.
    pub fn with_source(
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category: kind.default_category(),
            kind,
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Wraps an I/O error. Missing files and permission problems are
    /// attributed to the user, everything else is internal.
    pub fn io(msg: impl Into<String>, err: io::Error) -> Self {
        let category = match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorCategory::User,
            _ => ErrorCategory::Internal,
        };
        Self {
            category,
            kind: ErrorKind::Io,
            source: Some(Box::new(err)),
            msg: msg.into(),
        }
    }

    /// A corrupt container. The reason only goes to the debug log.
    pub fn corrupt(reason: &str) -> Self {
        tracing::debug!(reason, "rejecting corrupt container");
        Self::new(ErrorKind::CorruptContainer, UNAUTHENTIC_MESSAGE)
    }

    /// Tag verification failed.
    pub fn unauthentic() -> Self {
        Self::new(ErrorKind::AuthenticationFailure, UNAUTHENTIC_MESSAGE)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, VaultError>;
