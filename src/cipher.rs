//! Streaming authenticated encryption using XSalsa20 + HMAC-SHA256
//!
//! Content is encrypted with the XSalsa20 stream cipher and authenticated
//! encrypt-then-MAC with HMAC-SHA256. The MAC covers the associated data
//! (the encoded container header) followed by the entire ciphertext, so the
//! 32-byte tag binds the salt, nonce and declared size to the content.
//!
//! Data is processed in fixed-size chunks; memory use does not depend on the
//! size of the file.

use std::io::{self, Read, Write};

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::{Key, XNonce, XSalsa20};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};
use crate::kdf::DerivedKeyMaterial;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Generate a fresh random nonce.
///
/// Every encryption draws a new nonce; nonces are never derived from content.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn new_mac(keys: &DerivedKeyMaterial, associated_data: &[u8]) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(keys.mac_key()).map_err(|e| {
        VaultError::with_category(
            ErrorCategory::Internal,
            ErrorKind::InvalidInput,
            format!("failed to initialize HMAC: {}", e),
        )
    })?;
    mac.update(associated_data);
    Ok(mac)
}

fn new_cipher(keys: &DerivedKeyMaterial, nonce: &[u8; NONCE_LEN]) -> XSalsa20 {
    XSalsa20::new(
        Key::from_slice(keys.encryption_key()),
        XNonce::from_slice(nonce),
    )
}

/// Encrypting half of the engine.
pub struct StreamEncryptor {
    cipher: XSalsa20,
    mac: HmacSha256,
}

impl StreamEncryptor {
    pub fn new(
        keys: &DerivedKeyMaterial,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
    ) -> Result<Self> {
        Ok(Self {
            cipher: new_cipher(keys, nonce),
            mac: new_mac(keys, associated_data)?,
        })
    }

    /// Encrypt `chunk` in place and absorb the resulting ciphertext into the MAC.
    pub fn encrypt_chunk(&mut self, chunk: &mut [u8]) {
        self.cipher.apply_keystream(chunk);
        self.mac.update(chunk);
    }

    pub fn finalize(self) -> [u8; TAG_LEN] {
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&self.mac.finalize().into_bytes());
        tag
    }
}

/// Decrypting half of the engine.
///
/// Output of [`StreamDecryptor::decrypt_chunk`] is unauthenticated until
/// [`StreamDecryptor::verify`] succeeds.
pub struct StreamDecryptor {
    cipher: XSalsa20,
    mac: HmacSha256,
}

impl StreamDecryptor {
    pub fn new(
        keys: &DerivedKeyMaterial,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
    ) -> Result<Self> {
        Ok(Self {
            cipher: new_cipher(keys, nonce),
            mac: new_mac(keys, associated_data)?,
        })
    }

    /// Absorb `chunk` into the MAC and decrypt it in place.
    pub fn decrypt_chunk(&mut self, chunk: &mut [u8]) {
        self.mac.update(chunk);
        self.cipher.apply_keystream(chunk);
    }

    /// Absorb ciphertext into the MAC without decrypting it.
    pub fn authenticate_chunk(&mut self, chunk: &[u8]) {
        self.mac.update(chunk);
    }

    /// Constant-time comparison of the computed tag against `expected`.
    pub fn verify(self, expected: &[u8; TAG_LEN]) -> Result<()> {
        self.mac
            .verify_slice(expected)
            .map_err(|_| VaultError::unauthentic())
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt everything `reader` yields into `writer`.
///
/// `on_chunk` is called with the length of every chunk after it has been
/// written; an error from it stops the stream at that chunk boundary.
///
/// Returns the tag and the number of bytes processed.
pub fn encrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    keys: &DerivedKeyMaterial,
    nonce: &[u8; NONCE_LEN],
    associated_data: &[u8],
    chunk_size: usize,
    on_chunk: &mut dyn FnMut(usize) -> Result<()>,
) -> Result<([u8; TAG_LEN], u64)> {
    let mut encryptor = StreamEncryptor::new(keys, nonce, associated_data)?;
    let mut buf = Zeroizing::new(vec![0u8; chunk_size]);
    let mut total: u64 = 0;

    loop {
        let n = read_full(reader, &mut buf)
            .map_err(|e| VaultError::io("failed to read plaintext", e))?;
        if n == 0 {
            break;
        }
        encryptor.encrypt_chunk(&mut buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(|e| VaultError::io("failed to write ciphertext", e))?;
        total += n as u64;
        on_chunk(n)?;
    }

    Ok((encryptor.finalize(), total))
}

/// Decrypt exactly `length` bytes of ciphertext from `reader` into `writer`
/// and verify `expected_tag`.
///
/// `writer` receives plaintext before the tag has been checked, so it must
/// be a discardable destination (such as an uncommitted
/// [`crate::atomic::AtomicFile`]) that the caller throws away on error.
#[allow(clippy::too_many_arguments)]
pub fn decrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    length: u64,
    keys: &DerivedKeyMaterial,
    nonce: &[u8; NONCE_LEN],
    associated_data: &[u8],
    expected_tag: &[u8; TAG_LEN],
    chunk_size: usize,
    on_chunk: &mut dyn FnMut(usize) -> Result<()>,
) -> Result<()> {
    let mut decryptor = StreamDecryptor::new(keys, nonce, associated_data)?;
    let mut buf = Zeroizing::new(vec![0u8; chunk_size]);
    let mut remaining = length;

    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        let n = read_full(reader, &mut buf[..want])
            .map_err(|e| VaultError::io("failed to read ciphertext", e))?;
        if n < want {
            return Err(VaultError::corrupt("ciphertext shorter than declared size"));
        }
        decryptor.decrypt_chunk(&mut buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(|e| VaultError::io("failed to write plaintext", e))?;
        remaining -= n as u64;
        on_chunk(n)?;
    }

    decryptor.verify(expected_tag)
}

/// Check `expected_tag` against `length` bytes of ciphertext without
/// producing any plaintext.
#[allow(clippy::too_many_arguments)]
pub fn verify_stream<R: Read>(
    reader: &mut R,
    length: u64,
    keys: &DerivedKeyMaterial,
    nonce: &[u8; NONCE_LEN],
    associated_data: &[u8],
    expected_tag: &[u8; TAG_LEN],
    chunk_size: usize,
    on_chunk: &mut dyn FnMut(usize) -> Result<()>,
) -> Result<()> {
    let mut decryptor = StreamDecryptor::new(keys, nonce, associated_data)?;
    let mut buf = vec![0u8; chunk_size];
    let mut remaining = length;

    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        let n = read_full(reader, &mut buf[..want])
            .map_err(|e| VaultError::io("failed to read ciphertext", e))?;
        if n < want {
            return Err(VaultError::corrupt("ciphertext shorter than declared size"));
        }
        decryptor.authenticate_chunk(&buf[..n]);
        remaining -= n as u64;
        on_chunk(n)?;
    }

    decryptor.verify(expected_tag)
}
