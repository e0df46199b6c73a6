//! Versioned AES-256-CBC engine.
//!
//! Key:       SHA-256(UTF-8 password), see [`derive_key`].
//! Cipher:    AES-256-CBC, PKCS7 padding.
//!
//! | Mode       | Versions   | IV handling                                   | Encrypt |
//! |------------|------------|-----------------------------------------------|---------|
//! | `Legacy`   | 1, 2       | one fixed IV = SHA-256(key)[..16]             | no      |
//! | `LegacyIv` | 4          | 16-byte IV prefix on every buffer / region    | no      |
//! | `Block`    | 11, 12, 20 | fresh random IV prefix on every buffer/block  | yes     |
//!
//! Block-mode content is a sequence of `IV (16) | ciphertext` units, one per
//! plain block of `block_size` bytes; see [`crate::block`].

mod cipher;
mod password;

pub use cipher::{padded_len, KEY_SIZE};
pub use password::{
    create_password_check, derive_key, legacy_key_hash, verify_legacy, verify_signature, Password,
};

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::block::{encrypted_block_size, encrypted_buffer_size, read_block, AES_BLOCK, IV_SIZE};
use crate::error::{Error, Result};
use crate::header::FormatVersion;
use crate::index::PzFile;
use crate::progress::{self, CancelToken};
use cipher::{CbcCipher, ChainDecryptor};

/// Ceiling for single-shot buffer operations: 256 MiB.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Read granularity for legacy CBC chains.
const CHAIN_CHUNK: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Output buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },
    #[error("Input of {size} bytes exceeds the {max}-byte single-shot limit")]
    InputTooLarge { size: u64, max: usize },
    #[error("Version {version} containers are read-only")]
    EncryptUnsupported { version: u32 },
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Random number generator failed: {0}")]
    Random(String),
}

pub(crate) fn fill_random(buf: &mut [u8]) -> std::result::Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|e| CryptoError::Random(e.to_string()))
}

/// How one engine treats IVs.  Chosen once from the container version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Legacy { iv: [u8; 16] },
    LegacyIv,
    Block { block_size: u32 },
}

/// Count of encryption and decryption units performed by one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CipherStats {
    pub encrypted_units: u64,
    pub decrypted_units: u64,
}

/// Outcome of a streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// `plain` bytes went in or came out; `stored` bytes were on disk.
    Finished { plain: u64, stored: u64 },
    Cancelled,
}

// ── PzCrypto ────────────────────────────────────────────────────────────────

/// The engine for one open or in-progress container.  The key is wiped when
/// the engine drops.
pub struct PzCrypto {
    version:   FormatVersion,
    mode:      CipherMode,
    cipher:    CbcCipher,
    encrypted: AtomicU64,
    decrypted: AtomicU64,
}

impl PzCrypto {
    /// Select the variant for `version`.  `block_size` is only used by
    /// block-format versions and must then be a positive multiple of 16 no
    /// larger than [`MAX_BUFFER_SIZE`].
    pub fn for_version(version: FormatVersion, key: &[u8; KEY_SIZE], block_size: u32) -> Result<Self> {
        let mode = match version {
            FormatVersion::V1 | FormatVersion::V2 => {
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&Sha256::digest(key)[..16]);
                CipherMode::Legacy { iv }
            }
            FormatVersion::V4 => CipherMode::LegacyIv,
            FormatVersion::V11 | FormatVersion::V12 | FormatVersion::V20 => {
                if block_size == 0
                    || block_size as usize % AES_BLOCK != 0
                    || block_size as usize > MAX_BUFFER_SIZE
                {
                    return Err(Error::format("header", format!("invalid block size {block_size}")));
                }
                CipherMode::Block { block_size }
            }
        };
        Ok(Self {
            version,
            mode,
            cipher:    CbcCipher::new(key),
            encrypted: AtomicU64::new(0),
            decrypted: AtomicU64::new(0),
        })
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        self.cipher.key()
    }

    pub fn block_size(&self) -> Option<u32> {
        match self.mode {
            CipherMode::Block { block_size } => Some(block_size),
            _ => None,
        }
    }

    pub fn stats(&self) -> CipherStats {
        CipherStats {
            encrypted_units: self.encrypted.load(Ordering::Relaxed),
            decrypted_units: self.decrypted.load(Ordering::Relaxed),
        }
    }

    fn require_encrypt(&self) -> std::result::Result<(), CryptoError> {
        match self.mode {
            CipherMode::Block { .. } => Ok(()),
            _ => Err(CryptoError::EncryptUnsupported { version: self.version.as_u32() }),
        }
    }

    fn check_input(len: usize) -> std::result::Result<(), CryptoError> {
        if len > MAX_BUFFER_SIZE {
            return Err(CryptoError::InputTooLarge { size: len as u64, max: MAX_BUFFER_SIZE });
        }
        Ok(())
    }

    // ── Buffers ─────────────────────────────────────────────────────────────

    /// Write `IV | ciphertext` for `plain` into `out`, which must hold at
    /// least `encrypted_block_size(plain.len())` bytes.  Returns bytes written.
    pub fn encrypt_into(&self, plain: &[u8], out: &mut [u8]) -> std::result::Result<usize, CryptoError> {
        self.require_encrypt()?;
        Self::check_input(plain.len())?;
        let required = encrypted_block_size(plain.len());
        if out.len() < required {
            return Err(CryptoError::BufferTooSmall { required, actual: out.len() });
        }
        let (iv_part, body) = out.split_at_mut(IV_SIZE);
        let mut iv = [0u8; IV_SIZE];
        fill_random(&mut iv)?;
        iv_part.copy_from_slice(&iv);
        let n = self.cipher.encrypt(&iv, plain, body)?;
        self.encrypted.fetch_add(1, Ordering::Relaxed);
        Ok(IV_SIZE + n)
    }

    pub fn encrypt(&self, plain: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; encrypted_buffer_size(plain.len())];
        let n = self.encrypt_into(plain, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Deterministic encryption under a caller-supplied IV.  The IV is not
    /// included in the output.
    pub fn encrypt_with_iv(&self, plain: &[u8], iv: &[u8; 16]) -> std::result::Result<Vec<u8>, CryptoError> {
        self.require_encrypt()?;
        Self::check_input(plain.len())?;
        let mut out = vec![0u8; padded_len(plain.len())];
        let n = self.cipher.encrypt(iv, plain, &mut out)?;
        out.truncate(n);
        self.encrypted.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    /// Decrypt one unit produced by this version.  `out` must hold at least
    /// the input length minus the IV prefix.  Returns the plain length.
    pub fn decrypt_into(&self, input: &[u8], out: &mut [u8]) -> std::result::Result<usize, CryptoError> {
        Self::check_input(input.len())?;
        let n = match self.mode {
            CipherMode::Legacy { iv } => self.cipher.decrypt(&iv, input, out)?,
            CipherMode::LegacyIv | CipherMode::Block { .. } => {
                if input.len() < IV_SIZE {
                    return Err(CryptoError::Decrypt(format!(
                        "{}-byte unit is shorter than its IV", input.len()
                    )));
                }
                let (iv, body) = input.split_at(IV_SIZE);
                let mut iv_arr = [0u8; IV_SIZE];
                iv_arr.copy_from_slice(iv);
                self.cipher.decrypt(&iv_arr, body, out)?
            }
        };
        self.decrypted.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    pub fn decrypt(&self, input: &[u8]) -> std::result::Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; input.len()];
        let n = self.decrypt_into(input, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    // ── Streams ─────────────────────────────────────────────────────────────

    /// Split `reader` into plain blocks and write each one as its own
    /// `IV | ciphertext` unit.  `on_block` receives the plain length of each
    /// block after it is written.  `cancel` is polled before every block.
    pub fn encrypt_stream<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        on_block: &mut dyn FnMut(u64),
        cancel: Option<&CancelToken>,
    ) -> Result<StreamStatus>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        self.require_encrypt()?;
        let block_size = self.block_size().unwrap_or(0) as usize;
        let mut plain_buf = vec![0u8; block_size];
        let mut out = vec![0u8; encrypted_block_size(block_size)];
        let (mut plain, mut stored) = (0u64, 0u64);

        loop {
            if progress::is_cancelled(cancel) {
                return Ok(StreamStatus::Cancelled);
            }
            let n = read_block(reader, &mut plain_buf)?;
            if n == 0 {
                break;
            }
            let m = self.encrypt_into(&plain_buf[..n], &mut out)?;
            writer.write_all(&out[..m])?;
            plain  += n as u64;
            stored += m as u64;
            on_block(n as u64);
            if n < block_size {
                break;
            }
        }
        Ok(StreamStatus::Finished { plain, stored })
    }

    /// Decrypt `length` stored bytes starting at `offset` into `writer`.
    /// Works for every mode; legacy regions are one CBC chain.
    pub fn decrypt_region<R, W>(
        &self,
        reader: &mut R,
        offset: u64,
        length: u64,
        writer: &mut W,
        on_block: &mut dyn FnMut(u64),
        cancel: Option<&CancelToken>,
    ) -> Result<StreamStatus>
    where
        R: Read + Seek + ?Sized,
        W: Write + ?Sized,
    {
        reader.seek(SeekFrom::Start(offset))?;
        let mut region = reader.take(length);

        match self.mode {
            CipherMode::Block { block_size } => {
                self.decrypt_blocks(&mut region, length, block_size, writer, on_block, cancel)
            }
            CipherMode::Legacy { iv } => {
                self.decrypt_chain(&mut region, length, &iv, writer, on_block, cancel)
            }
            CipherMode::LegacyIv => {
                let mut iv = [0u8; IV_SIZE];
                region.read_exact(&mut iv).map_err(|_| truncated_region(offset, length))?;
                let status = self.decrypt_chain(
                    &mut region, length - IV_SIZE as u64, &iv, writer, on_block, cancel,
                )?;
                Ok(match status {
                    StreamStatus::Finished { plain, stored } => {
                        StreamStatus::Finished { plain, stored: stored + IV_SIZE as u64 }
                    }
                    cancelled => cancelled,
                })
            }
        }
    }

    /// Decrypt one whole file into memory.  Bounded by [`MAX_BUFFER_SIZE`].
    pub fn decrypt_file<R: Read + Seek + ?Sized>(&self, reader: &mut R, file: &PzFile) -> Result<Vec<u8>> {
        if file.size > MAX_BUFFER_SIZE as u64 {
            return Err(CryptoError::InputTooLarge { size: file.size, max: MAX_BUFFER_SIZE }.into());
        }
        let mut out = Vec::with_capacity(file.origin_size.min(MAX_BUFFER_SIZE as u64) as usize);
        self.decrypt_region(reader, file.offset, file.size, &mut out, &mut |_| {}, None)?;
        Ok(out)
    }

    fn decrypt_blocks<R, W>(
        &self,
        region: &mut R,
        length: u64,
        block_size: u32,
        writer: &mut W,
        on_block: &mut dyn FnMut(u64),
        cancel: Option<&CancelToken>,
    ) -> Result<StreamStatus>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let unit = encrypted_block_size(block_size as usize);
        let mut input = vec![0u8; unit];
        let mut out = vec![0u8; unit];
        let (mut plain, mut stored) = (0u64, 0u64);

        while stored < length {
            if progress::is_cancelled(cancel) {
                return Ok(StreamStatus::Cancelled);
            }
            let n = read_block(region, &mut input)?;
            if n == 0 {
                break;
            }
            let m = self.decrypt_into(&input[..n], &mut out)?;
            writer.write_all(&out[..m])?;
            plain  += m as u64;
            stored += n as u64;
            on_block(m as u64);
        }
        if stored != length {
            return Err(Error::format("content", format!(
                "expected {length} stored bytes, found {stored}"
            )));
        }
        Ok(StreamStatus::Finished { plain, stored })
    }

    fn decrypt_chain<R, W>(
        &self,
        region: &mut R,
        length: u64,
        iv: &[u8; 16],
        writer: &mut W,
        on_block: &mut dyn FnMut(u64),
        cancel: Option<&CancelToken>,
    ) -> Result<StreamStatus>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        if length == 0 || length % AES_BLOCK as u64 != 0 {
            return Err(CryptoError::Decrypt(format!(
                "region length {length} is not a positive multiple of {AES_BLOCK}"
            )).into());
        }
        let mut chain = self.cipher.chain(iv);
        let mut buf = vec![0u8; CHAIN_CHUNK];
        let (mut plain, mut remaining) = (0u64, length);

        while remaining > 0 {
            if progress::is_cancelled(cancel) {
                return Ok(StreamStatus::Cancelled);
            }
            let want = remaining.min(CHAIN_CHUNK as u64) as usize;
            let chunk = &mut buf[..want];
            region.read_exact(chunk).map_err(|_| Error::format("content", "region truncated"))?;
            chain.decrypt_blocks(chunk);
            remaining -= want as u64;

            let keep = if remaining == 0 {
                let last = want - AES_BLOCK;
                last + ChainDecryptor::unpad_len(&chunk[last..])?
            } else {
                want
            };
            writer.write_all(&chunk[..keep])?;
            plain += keep as u64;
            self.decrypted.fetch_add(1, Ordering::Relaxed);
            on_block(keep as u64);
        }
        Ok(StreamStatus::Finished { plain, stored: length })
    }
}

impl std::fmt::Debug for PzCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PzCrypto")
            .field("version", &self.version)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn truncated_region(offset: u64, length: u64) -> Error {
    Error::format("content", format!("region {offset}+{length} is shorter than its IV"))
}
