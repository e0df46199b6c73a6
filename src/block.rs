//! Block geometry for streamed content.
//!
//! A file of `length` plain bytes is split into `ceil(length / block_size)`
//! blocks; every block but the last is exactly `block_size` bytes.  Each
//! block is encrypted on its own and stored as `IV (16) | AES-CBC(PKCS7)`,
//! so an encrypted block is always
//!
//! ```text
//! encrypted_block_size(n) = n + (16 - n % 16) + 16
//! ```
//!
//! bytes.  Single-buffer sections (index, detail, notes) use the same
//! formula with `n` = buffer length.

use std::io::{self, Read};

/// Length of the IV prefix in front of every encrypted unit.
pub const IV_SIZE: usize = 16;
/// AES block length.
pub const AES_BLOCK: usize = 16;
/// Block sizes used for packing must be a positive multiple of this.
pub const BLOCK_SIZE_ALIGN: u32 = 64 * 1024;
/// Default packing block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;

/// Size of `plain_len` bytes once padded, encrypted and prefixed with an IV.
#[inline]
pub fn encrypted_block_size(plain_len: usize) -> usize {
    plain_len + (AES_BLOCK - plain_len % AES_BLOCK) + IV_SIZE
}

/// Stored size of a single-shot buffer (index, detail, note body).
#[inline]
pub fn encrypted_buffer_size(len: usize) -> usize {
    encrypted_block_size(len)
}

/// Inverse of [`encrypted_block_size`] for block-aligned plaintext.
///
/// Exact when the plaintext length was a multiple of 16 (every full block
/// of a valid block size).  For a short final block this is only an upper
/// bound; the real length comes out of padding removal.
#[inline]
pub fn decrypted_block_size(encrypted_len: usize) -> usize {
    encrypted_len
        .saturating_sub(AES_BLOCK - encrypted_len % AES_BLOCK)
        .saturating_sub(IV_SIZE)
}

/// True if `block_size` may be used to pack a container.
pub fn is_valid_block_size(block_size: u32) -> bool {
    block_size > 0
        && block_size % BLOCK_SIZE_ALIGN == 0
        && block_size as usize <= crate::crypto::MAX_BUFFER_SIZE
}

// ── BlockLayout ─────────────────────────────────────────────────────────────

/// Partition of a byte range into fixed-size blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub length:     u64,
    pub block_size: u64,
}

impl BlockLayout {
    pub fn new(length: u64, block_size: u64) -> Self {
        Self { length, block_size: block_size.max(1) }
    }

    /// Layout of an encrypted region whose plain blocks were `plain_block`
    /// bytes long.
    pub fn encrypted(stored_len: u64, plain_block: u32) -> Self {
        Self::new(stored_len, encrypted_block_size(plain_block as usize) as u64)
    }

    pub fn count(&self) -> u64 {
        self.length.div_ceil(self.block_size)
    }

    pub fn block_len(&self, index: u64) -> u64 {
        if index + 1 < self.count() || self.length % self.block_size == 0 {
            self.block_size
        } else {
            self.length % self.block_size
        }
    }

    pub fn block_offset(&self, index: u64) -> u64 {
        index * self.block_size
    }
}

/// Read until `buf` is full or the reader is exhausted.  Returns the number
/// of bytes placed in `buf`; anything below `buf.len()` means EOF.
pub fn read_block<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0)  => break,
            Ok(n)  => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
