//! AES-256-CBC primitives shared by every container version.

use cbc::cipher::block_padding::{Padding, Pkcs7};
use cbc::cipher::consts::U16;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroizing;

use super::CryptoError;
use crate::block::AES_BLOCK;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_SIZE: usize = 32;

/// Ciphertext length of `plain_len` bytes under PKCS7 (always at least one
/// padding byte).
#[inline]
pub fn padded_len(plain_len: usize) -> usize {
    plain_len + (AES_BLOCK - plain_len % AES_BLOCK)
}

/// Owns the 256-bit key; wiped on drop.
pub(crate) struct CbcCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl CbcCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self { key: Zeroizing::new(*key) }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Pad and encrypt `plain` into the front of `out`.  Returns the
    /// ciphertext length.
    pub fn encrypt(&self, iv: &[u8; 16], plain: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        let required = padded_len(plain.len());
        if out.len() < required {
            return Err(CryptoError::BufferTooSmall { required, actual: out.len() });
        }
        let actual = out.len();
        out[..plain.len()].copy_from_slice(plain);

        let enc = Aes256CbcEnc::new(GenericArray::from_slice(&self.key[..]), GenericArray::from_slice(&iv[..]));
        let written = enc
            .encrypt_padded_mut::<Pkcs7>(&mut out[..required], plain.len())
            .map_err(|_| CryptoError::BufferTooSmall { required, actual })?
            .len();
        Ok(written)
    }

    /// Decrypt `cipher` into the front of `out` and strip the padding.
    /// `out` must hold at least `cipher.len()` bytes.
    pub fn decrypt(&self, iv: &[u8; 16], cipher: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        if cipher.is_empty() || cipher.len() % AES_BLOCK != 0 {
            return Err(CryptoError::Decrypt(format!(
                "ciphertext length {} is not a positive multiple of {AES_BLOCK}",
                cipher.len()
            )));
        }
        if out.len() < cipher.len() {
            return Err(CryptoError::BufferTooSmall { required: cipher.len(), actual: out.len() });
        }
        let buf = &mut out[..cipher.len()];
        buf.copy_from_slice(cipher);

        let dec = Aes256CbcDec::new(GenericArray::from_slice(&self.key[..]), GenericArray::from_slice(&iv[..]));
        let plain = dec
            .decrypt_padded_mut::<Pkcs7>(buf)
            .map_err(|_| CryptoError::Decrypt("invalid padding".into()))?;
        Ok(plain.len())
    }

    /// Stateful decryptor for one long CBC chain.
    pub fn chain(&self, iv: &[u8; 16]) -> ChainDecryptor {
        ChainDecryptor {
            inner: Aes256CbcDec::new(GenericArray::from_slice(&self.key[..]), GenericArray::from_slice(&iv[..])),
        }
    }
}

/// Decrypts a CBC chain piecewise.  The caller keeps the final block back
/// and strips its padding with [`ChainDecryptor::unpad_len`].
pub(crate) struct ChainDecryptor {
    inner: Aes256CbcDec,
}

impl ChainDecryptor {
    /// `buf.len()` must be a multiple of 16.
    pub fn decrypt_blocks(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_exact_mut(AES_BLOCK) {
            self.inner.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
    }

    /// Plain length left in an already-decrypted final block.
    pub fn unpad_len(last: &[u8]) -> Result<usize, CryptoError> {
        if last.len() != AES_BLOCK {
            return Err(CryptoError::Decrypt("final block is not 16 bytes".into()));
        }
        <Pkcs7 as Padding<U16>>::unpad(GenericArray::from_slice(last))
            .map(|plain| plain.len())
            .map_err(|_| CryptoError::Decrypt("invalid padding".into()))
    }
}
