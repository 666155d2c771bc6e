//! Engine configuration

use crate::error::{ErrorKind, Result, VaultError};

/// Tunables for a [`crate::vault::Vault`].
///
/// Nothing here affects the container format; a container written with one
/// configuration can be read with any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultConfig {
    /// Size of the buffer used to stream file content through the cipher.
    pub chunk_size: usize,
    /// Number of progress steps per processing phase. At most
    /// `progress_steps + 1` progress notifications are delivered per phase.
    pub progress_steps: u32,
}

impl VaultConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
    pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
    pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

    pub const DEFAULT_PROGRESS_STEPS: u32 = 100;
    pub const MAX_PROGRESS_STEPS: u32 = 10_000;

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_progress_steps(mut self, progress_steps: u32) -> Self {
        self.progress_steps = progress_steps;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_CHUNK_SIZE..=Self::MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(VaultError::new(
                ErrorKind::InvalidInput,
                format!(
                    "chunk size {} out of range ({}..={})",
                    self.chunk_size,
                    Self::MIN_CHUNK_SIZE,
                    Self::MAX_CHUNK_SIZE
                ),
            ));
        }
        if !(1..=Self::MAX_PROGRESS_STEPS).contains(&self.progress_steps) {
            return Err(VaultError::new(
                ErrorKind::InvalidInput,
                format!(
                    "progress steps {} out of range (1..={})",
                    self.progress_steps,
                    Self::MAX_PROGRESS_STEPS
                ),
            ));
        }
        Ok(())
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            progress_steps: Self::DEFAULT_PROGRESS_STEPS,
        }
    }
}

/// Parse a human-friendly size such as `65536`, `64K` or `1M`.
pub fn parse_size(s: &str) -> std::result::Result<usize, String> {
    let s = s.trim().to_ascii_lowercase();
    let (num, mult) = if let Some(rest) = s.strip_suffix("kb").or_else(|| s.strip_suffix('k')) {
        (rest, 1024)
    } else if let Some(rest) = s.strip_suffix("mb").or_else(|| s.strip_suffix('m')) {
        (rest, 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };
    let n: usize = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {}", s))?;
    n.checked_mul(mult)
        .ok_or_else(|| format!("size too large: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        VaultConfig::default().validate().unwrap();
    }

    #[test]
    fn test_chunk_size_bounds() {
        let err = VaultConfig::default()
            .with_chunk_size(16)
            .validate()
            .expect_err("tiny chunks must be rejected");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let err = VaultConfig::default()
            .with_chunk_size(VaultConfig::MAX_CHUNK_SIZE + 1)
            .validate()
            .expect_err("huge chunks must be rejected");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        VaultConfig::default()
            .with_chunk_size(VaultConfig::MIN_CHUNK_SIZE)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_progress_steps_bounds() {
        let err = VaultConfig::default()
            .with_progress_steps(0)
            .validate()
            .expect_err("zero steps must be rejected");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(64 * 1024));
        assert_eq!(parse_size("64kb"), Ok(64 * 1024));
        assert_eq!(parse_size(" 2M "), Ok(2 * 1024 * 1024));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }
}
