//! Passphrase key derivation using scrypt
//!
//! One scrypt invocation yields 64 bytes, split into a 32-byte encryption
//! key and a 32-byte MAC key.

use std::fmt;
use std::time::Instant;

use rand::RngCore;
use rand::rngs::OsRng;
use scrypt::{Params, scrypt};
use zeroize::Zeroizing;

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};

/// Length of salt in bytes
pub const SALT_LEN: usize = 16;

/// Length of each derived key in bytes
pub const KEY_LEN: usize = 32;

/// scrypt cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfCost {
    log_n: u8,
    r: u32,
    p: u32,
}

impl KdfCost {
    /// Below this, brute forcing weak passphrases becomes cheap.
    pub const MIN_LOG_N: u8 = 14;
    /// Above this, memory use (128 * r * 2^log_n bytes) and time get out of hand.
    pub const MAX_LOG_N: u8 = 20;
    pub const MAX_R: u32 = 32;
    pub const MAX_P: u32 = 4;

    /// Cost pinned by format version 1: N = 32768, r = 8, p = 1.
    pub const V1: KdfCost = KdfCost {
        log_n: 15,
        r: 8,
        p: 1,
    };

    pub fn new(log_n: u8, r: u32, p: u32) -> Result<Self> {
        if !(Self::MIN_LOG_N..=Self::MAX_LOG_N).contains(&log_n)
            || !(1..=Self::MAX_R).contains(&r)
            || !(1..=Self::MAX_P).contains(&p)
        {
            return Err(VaultError::new(
                ErrorKind::InvalidInput,
                format!("scrypt cost out of bounds (log_n={}, r={}, p={})", log_n, r, p),
            ));
        }
        Ok(Self { log_n, r, p })
    }

    /// The cost a given container format version was written with.
    pub fn for_version(version: u8) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            _ => None,
        }
    }
}

/// Encryption and MAC keys derived from one passphrase and salt.
///
/// Both keys are wiped from memory on drop.
pub struct DerivedKeyMaterial {
    encryption_key: Zeroizing<[u8; KEY_LEN]>,
    mac_key: Zeroizing<[u8; KEY_LEN]>,
}

impl DerivedKeyMaterial {
    pub fn encryption_key(&self) -> &[u8; KEY_LEN] {
        &self.encryption_key
    }

    pub fn mac_key(&self) -> &[u8; KEY_LEN] {
        &self.mac_key
    }
}

impl fmt::Debug for DerivedKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeyMaterial")
            .field("encryption_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh random salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive key material from a passphrase and salt.
///
/// Deterministic: the same passphrase, salt and cost always produce the same
/// keys, which is what lets decryption rebuild them from the stored salt.
pub fn derive(passphrase: &[u8], salt: &[u8; SALT_LEN], cost: KdfCost) -> Result<DerivedKeyMaterial> {
    if passphrase.is_empty() {
        return Err(VaultError::new(
            ErrorKind::InvalidPassphrase,
            "passphrase must not be empty",
        ));
    }

    let params = Params::new(cost.log_n, cost.r, cost.p, 2 * KEY_LEN).map_err(|e| {
        VaultError::with_category(
            ErrorCategory::Internal,
            ErrorKind::InvalidInput,
            format!("failed to create scrypt params: {}", e),
        )
    })?;

    let started = Instant::now();
    let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
    scrypt(passphrase, salt, &params, &mut okm[..]).map_err(|e| {
        VaultError::with_category(
            ErrorCategory::Internal,
            ErrorKind::InvalidInput,
            format!("scrypt key derivation failed: {}", e),
        )
    })?;
    tracing::debug!(
        log_n = cost.log_n,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "derived key material"
    );

    let mut encryption_key = Zeroizing::new([0u8; KEY_LEN]);
    let mut mac_key = Zeroizing::new([0u8; KEY_LEN]);
    encryption_key.copy_from_slice(&okm[..KEY_LEN]);
    mac_key.copy_from_slice(&okm[KEY_LEN..]);

    Ok(DerivedKeyMaterial {
        encryption_key,
        mac_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cost() -> KdfCost {
        KdfCost::new(KdfCost::MIN_LOG_N, 8, 1).unwrap()
    }

    #[test]
    fn test_deterministic() {
        let salt = [1u8; SALT_LEN];

        let a = derive(b"correct-horse", &salt, fast_cost()).unwrap();
        let b = derive(b"correct-horse", &salt, fast_cost()).unwrap();

        assert_eq!(a.encryption_key(), b.encryption_key());
        assert_eq!(a.mac_key(), b.mac_key());
    }

    #[test]
    fn test_keys_are_independent() {
        let keys = derive(b"correct-horse", &[7u8; SALT_LEN], fast_cost()).unwrap();
        assert_ne!(keys.encryption_key(), keys.mac_key());
    }

    #[test]
    fn test_different_passphrases() {
        let salt = [1u8; SALT_LEN];
        let a = derive(b"passphrase-a", &salt, fast_cost()).unwrap();
        let b = derive(b"passphrase-b", &salt, fast_cost()).unwrap();
        assert_ne!(a.encryption_key(), b.encryption_key());
    }

    #[test]
    fn test_different_salts() {
        let a = derive(b"same", &[1u8; SALT_LEN], fast_cost()).unwrap();
        let b = derive(b"same", &[2u8; SALT_LEN], fast_cost()).unwrap();
        assert_ne!(a.encryption_key(), b.encryption_key());
    }

    #[test]
    fn test_empty_passphrase() {
        let err = derive(b"", &[0u8; SALT_LEN], fast_cost()).expect_err("empty must fail");
        assert_eq!(err.kind, ErrorKind::InvalidPassphrase);
    }

    #[test]
    fn test_cost_bounds() {
        assert!(KdfCost::new(KdfCost::MIN_LOG_N - 1, 8, 1).is_err());
        assert!(KdfCost::new(KdfCost::MAX_LOG_N + 1, 8, 1).is_err());
        assert!(KdfCost::new(15, 0, 1).is_err());
        assert!(KdfCost::new(15, 8, 0).is_err());
        assert!(KdfCost::new(15, 8, KdfCost::MAX_P + 1).is_err());
        assert_eq!(KdfCost::new(15, 8, 1).unwrap(), KdfCost::V1);
    }

    #[test]
    fn test_cost_for_version() {
        assert_eq!(KdfCost::for_version(1), Some(KdfCost::V1));
        assert_eq!(KdfCost::for_version(0), None);
        assert_eq!(KdfCost::for_version(2), None);
    }

    #[test]
    fn test_debug_is_redacted() {
        let keys = derive(b"secret", &[3u8; SALT_LEN], fast_cost()).unwrap();
        let rendered = format!("{:?}", keys);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("encryption_key: ["));
    }

    #[test]
    fn test_salts_are_fresh() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
