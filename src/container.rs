//! On-disk container format
//!
//! All integers are big-endian. The layout is:
//! - magic: 4 bytes, `FVv1`
//! - version: 1 byte
//! - salt length: 1 byte, followed by the salt
//! - nonce length: 1 byte, followed by the nonce
//! - original size: 8 bytes (u64)
//! - ciphertext: original size bytes
//! - tag: 32 bytes (HMAC-SHA256 over header and ciphertext)

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::Path;

use crate::atomic::AtomicFile;
use crate::cipher::{NONCE_LEN, TAG_LEN};
use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};
use crate::kdf::SALT_LEN;

/// Magic marker for all filevault containers
pub const MAGIC: [u8; 4] = *b"FVv1";

/// Shared prefix of the magic marker across format generations
const MAGIC_PREFIX: &[u8] = b"FV";

/// The only format version this build writes and reads
pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u8,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub original_size: u64,
}

impl ContainerHeader {
    /// Encoded length of a header in bytes.
    pub const ENCODED_LEN: usize = MAGIC.len() + 1 + 1 + SALT_LEN + 1 + NONCE_LEN + 8;

    pub fn new(salt: [u8; SALT_LEN], nonce: [u8; NONCE_LEN], original_size: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            salt,
            nonce,
            original_size,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&MAGIC);
        out.push(self.version);
        out.push(SALT_LEN as u8);
        out.extend_from_slice(&self.salt);
        out.push(NONCE_LEN as u8);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.original_size.to_be_bytes());
        out
    }

    /// Read and validate a header. Magic and version are checked before
    /// anything else is interpreted.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_field(reader, &mut magic, "magic")?;
        if magic != MAGIC {
            return Err(if magic.starts_with(MAGIC_PREFIX) {
                VaultError::new(
                    ErrorKind::UnsupportedFormat,
                    "input claims to be a filevault container, but not a version we support",
                )
            } else {
                VaultError::new(
                    ErrorKind::UnsupportedFormat,
                    "input unrecognized as a filevault container",
                )
            });
        }

        let mut version = [0u8; 1];
        read_field(reader, &mut version, "version")?;
        if version[0] != FORMAT_VERSION {
            return Err(VaultError::new(
                ErrorKind::UnsupportedFormat,
                format!("unsupported container format version {}", version[0]),
            ));
        }

        let mut salt = [0u8; SALT_LEN];
        read_length_prefix(reader, SALT_LEN, "salt")?;
        read_field(reader, &mut salt, "salt")?;

        let mut nonce = [0u8; NONCE_LEN];
        read_length_prefix(reader, NONCE_LEN, "nonce")?;
        read_field(reader, &mut nonce, "nonce")?;

        let mut size = [0u8; 8];
        read_field(reader, &mut size, "original size")?;

        Ok(Self {
            version: version[0],
            salt,
            nonce,
            original_size: u64::from_be_bytes(size),
        })
    }

    /// Total length of a container holding this header, or `None` if the
    /// declared size cannot be represented.
    pub fn container_len(&self) -> Option<u64> {
        (Self::ENCODED_LEN as u64)
            .checked_add(self.original_size)?
            .checked_add(TAG_LEN as u64)
    }
}

fn read_field<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            VaultError::corrupt(&format!("input truncated while reading {}", what))
        } else {
            VaultError::io(format!("failed to read container {}", what), e)
        }
    })
}

fn read_length_prefix<R: Read>(reader: &mut R, expected: usize, what: &str) -> Result<()> {
    let mut len = [0u8; 1];
    read_field(reader, &mut len, what)?;
    if len[0] as usize != expected {
        return Err(VaultError::corrupt(&format!(
            "{} length {} (expected {})",
            what, len[0], expected
        )));
    }
    Ok(())
}

/// Writes a container to a temporary file and publishes it atomically.
///
/// Dropping the writer before [`ContainerWriter::finish`] deletes the
/// temporary file and leaves the destination untouched.
pub struct ContainerWriter {
    out: AtomicFile,
    remaining: u64,
}

impl ContainerWriter {
    pub fn create(dest: &Path, header: &ContainerHeader) -> Result<Self> {
        let mut out = AtomicFile::create(dest)?;
        out.write_all(&header.to_bytes())
            .map_err(|e| VaultError::io("failed to write container header", e))?;
        Ok(Self {
            out,
            remaining: header.original_size,
        })
    }

    /// Append the tag and rename the container into place.
    ///
    /// Fails if the ciphertext written does not match the size declared in
    /// the header.
    pub fn finish(mut self, tag: &[u8; TAG_LEN]) -> Result<()> {
        if self.remaining != 0 {
            return Err(VaultError::with_category(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "ciphertext length does not match the declared size",
            ));
        }
        self.out
            .write_all(tag)
            .map_err(|e| VaultError::io("failed to write container tag", e))?;
        self.out.commit()
    }
}

impl Write for ContainerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() as u64 > self.remaining {
            return Err(io::Error::other("ciphertext exceeds the declared size"));
        }
        let n = self.out.write(buf)?;
        self.remaining -= n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// A validated container, positioned at the start of its ciphertext.
pub struct OpenedContainer<R> {
    pub header: ContainerHeader,
    /// The encoded header, authenticated together with the ciphertext.
    pub header_bytes: Vec<u8>,
    pub ciphertext: Take<R>,
    pub tag: [u8; TAG_LEN],
}

/// Validate a container and locate its ciphertext and tag.
pub fn read_container<R: Read + Seek>(mut src: R) -> Result<OpenedContainer<R>> {
    let total_len = src
        .seek(SeekFrom::End(0))
        .map_err(|e| VaultError::io("failed to determine container size", e))?;
    src.seek(SeekFrom::Start(0))
        .map_err(|e| VaultError::io("failed to seek in container", e))?;

    let header = ContainerHeader::read_from(&mut src)?;
    let expected_len = header
        .container_len()
        .ok_or_else(|| VaultError::corrupt("declared size overflows"))?;
    if total_len != expected_len {
        return Err(VaultError::corrupt(&format!(
            "container is {} bytes but header declares {}",
            total_len, expected_len
        )));
    }

    let mut tag = [0u8; TAG_LEN];
    src.seek(SeekFrom::Start(total_len - TAG_LEN as u64))
        .map_err(|e| VaultError::io("failed to seek to container tag", e))?;
    read_field(&mut src, &mut tag, "tag")?;
    src.seek(SeekFrom::Start(ContainerHeader::ENCODED_LEN as u64))
        .map_err(|e| VaultError::io("failed to seek to ciphertext", e))?;

    let header_bytes = header.to_bytes();
    let original_size = header.original_size;
    Ok(OpenedContainer {
        header,
        header_bytes,
        ciphertext: src.take(original_size),
        tag,
    })
}

/// Open and validate the container at `path`.
pub fn open(path: &Path) -> Result<OpenedContainer<BufReader<File>>> {
    let file = File::open(path)
        .map_err(|e| VaultError::io(format!("failed to read from {}", path.display()), e))?;
    read_container(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn sample_header(size: u64) -> ContainerHeader {
        ContainerHeader::new([0x42u8; SALT_LEN], [0x24u8; NONCE_LEN], size)
    }

    fn sample_container(ciphertext: &[u8]) -> Vec<u8> {
        let mut bytes = sample_header(ciphertext.len() as u64).to_bytes();
        bytes.extend_from_slice(ciphertext);
        bytes.extend_from_slice(&[0xAAu8; TAG_LEN]);
        bytes
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample_header(0x1c).to_bytes();

        #[rustfmt::skip]
        let expected: Vec<u8> = vec![
            b'F', b'V', b'v', b'1',
            0x01,
            0x10,
            0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42,
            0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42,
            0x18,
            0x24, 0x24, 0x24, 0x24, 0x24, 0x24, 0x24, 0x24,
            0x24, 0x24, 0x24, 0x24, 0x24, 0x24, 0x24, 0x24,
            0x24, 0x24, 0x24, 0x24, 0x24, 0x24, 0x24, 0x24,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1c,
        ];

        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), ContainerHeader::ENCODED_LEN);
    }

    #[test]
    fn test_header_parse() {
        let header = sample_header(12345);
        let parsed = ContainerHeader::read_from(&mut Cursor::new(header.to_bytes())).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_read_container() {
        let bytes = sample_container(b"ciphertext");
        let mut opened = read_container(Cursor::new(bytes)).unwrap();

        assert_eq!(opened.header, sample_header(10));
        assert_eq!(opened.header_bytes, sample_header(10).to_bytes());
        assert_eq!(opened.tag, [0xAAu8; TAG_LEN]);

        let mut ciphertext = Vec::new();
        opened.ciphertext.read_to_end(&mut ciphertext).unwrap();
        assert_eq!(ciphertext, b"ciphertext");
    }

    #[test]
    fn test_empty_container() {
        let bytes = sample_container(b"");
        assert_eq!(bytes.len(), ContainerHeader::ENCODED_LEN + TAG_LEN);
        let opened = read_container(Cursor::new(bytes)).unwrap();
        assert_eq!(opened.header.original_size, 0);
    }

    #[test]
    fn test_not_a_container() {
        let bytes = b"something not looking like a container at all, really".to_vec();
        let err = read_container(Cursor::new(bytes)).err().expect("expected failure");
        assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_future_magic() {
        let mut bytes = sample_container(b"abc");
        bytes[3] = b'9';
        let err = read_container(Cursor::new(bytes)).err().expect("expected failure");
        assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_unknown_version() {
        let mut bytes = sample_container(b"abc");
        bytes[4] = 2;
        let err = read_container(Cursor::new(bytes)).err().expect("expected failure");
        assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_truncated_header() {
        let bytes = sample_container(b"abc");
        for len in [0, 3, 5, 10, 30, ContainerHeader::ENCODED_LEN - 1] {
            let err = read_container(Cursor::new(bytes[..len].to_vec()))
                .err()
                .expect("expected failure");
            assert_eq!(err.kind, ErrorKind::CorruptContainer, "length {}", len);
        }
    }

    #[test]
    fn test_wrong_salt_length() {
        let mut bytes = sample_container(b"abc");
        bytes[5] = 8;
        let err = read_container(Cursor::new(bytes)).err().expect("expected failure");
        assert_eq!(err.kind, ErrorKind::CorruptContainer);
    }

    #[test]
    fn test_truncated_body() {
        let mut bytes = sample_container(b"some ciphertext");
        bytes.truncate(bytes.len() - 1);
        let err = read_container(Cursor::new(bytes)).err().expect("expected failure");
        assert_eq!(err.kind, ErrorKind::CorruptContainer);
    }

    #[test]
    fn test_trailing_data() {
        let mut bytes = sample_container(b"some ciphertext");
        bytes.push(0xFF);
        let err = read_container(Cursor::new(bytes)).err().expect("expected failure");
        assert_eq!(err.kind, ErrorKind::CorruptContainer);
    }

    #[test]
    fn test_declared_size_overflow() {
        let mut bytes = sample_container(b"");
        let size_at = ContainerHeader::ENCODED_LEN - 8;
        bytes[size_at..size_at + 8].copy_from_slice(&u64::MAX.to_be_bytes());
        let err = read_container(Cursor::new(bytes)).err().expect("expected failure");
        assert_eq!(err.kind, ErrorKind::CorruptContainer);
    }

    #[test]
    fn test_writer_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.fv");
        let header = sample_header(5);

        let mut writer = ContainerWriter::create(&dest, &header).unwrap();
        writer.write_all(b"12345").unwrap();
        writer.finish(&[7u8; TAG_LEN]).unwrap();

        let mut opened = open(&dest).unwrap();
        assert_eq!(opened.header, header);
        assert_eq!(opened.tag, [7u8; TAG_LEN]);
        let mut ciphertext = Vec::new();
        opened.ciphertext.read_to_end(&mut ciphertext).unwrap();
        assert_eq!(ciphertext, b"12345");
    }

    #[test]
    fn test_writer_rejects_size_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out.fv");

        let mut writer = ContainerWriter::create(&dest, &sample_header(5)).unwrap();
        writer.write_all(b"123").unwrap();
        assert!(writer.finish(&[0u8; TAG_LEN]).is_err());
        assert!(!dest.exists());

        let mut writer = ContainerWriter::create(&dest, &sample_header(2)).unwrap();
        assert!(writer.write_all(b"123").is_err());
        drop(writer);
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }
}
