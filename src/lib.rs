//! FileVault - Passphrase-based encrypted file containers
//!
//! Files are sealed with XSalsa20 and HMAC-SHA256 under keys derived from a
//! passphrase with scrypt. Content is streamed in chunks so memory use does
//! not depend on file size, and every output is published atomically.

#![forbid(unsafe_code)]

pub mod atomic;
pub mod cipher;
pub mod config;
pub mod container;
pub mod error;
pub mod kdf;
pub mod passphrase;
pub mod task;
pub mod vault;

pub use config::VaultConfig;
pub use error::{ErrorCategory, ErrorKind, Result, VaultError};
pub use task::OperationHandle;
pub use vault::{CancelToken, Monitor, Progress, Report, Request, Stage, Vault};
