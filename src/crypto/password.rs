//! Passwords, key derivation and the two password-check policies.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{PzCrypto, KEY_SIZE};
use crate::error::{Error, Result};

/// A container password.  Wiped from memory on drop.
#[derive(Clone)]
pub struct Password {
    inner: Zeroizing<String>,
}

impl Password {
    pub fn new<S: Into<String>>(password: S) -> Self {
        Self { inner: Zeroizing::new(password.into()) }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// True when the password is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.inner.trim().is_empty()
    }

    pub fn derive_key(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        derive_key(&self.inner)
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Password").field("len", &self.inner.len()).finish()
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Password {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// SHA-256 of the UTF-8 password.  No salt, no iterations: every existing
/// container was written with exactly this key.
pub fn derive_key(password: &str) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&Sha256::digest(password.as_bytes()));
    key
}

/// `SHA-256(HEX(SHA-256(key)))` with upper-case hex, as stored by every
/// version before 20.
pub fn legacy_key_hash(key: &[u8; KEY_SIZE]) -> [u8; 32] {
    let hex = hex::encode_upper(Sha256::digest(key));
    Sha256::digest(hex.as_bytes()).into()
}

pub fn verify_legacy(key: &[u8; KEY_SIZE], stored: &[u8]) -> Result<()> {
    if legacy_key_hash(key).as_slice() != stored {
        return Err(Error::PasswordIncorrect);
    }
    Ok(())
}

/// Build the 64-byte check stored in a version 20 header: a fresh IV
/// followed by the type signature encrypted under that IV.
pub fn create_password_check(crypto: &PzCrypto, sign: &[u8; 32]) -> Result<Vec<u8>> {
    let mut iv = [0u8; 16];
    super::fill_random(&mut iv)?;
    let mut check = iv.to_vec();
    check.extend_from_slice(&crypto.encrypt_with_iv(sign, &iv)?);
    Ok(check)
}

/// Re-encrypt `sign` with the IV found at the front of `stored` and compare
/// with the rest.  Only encrypts; never decrypts anything.
pub fn verify_signature(crypto: &PzCrypto, sign: &[u8; 32], stored: &[u8]) -> Result<()> {
    if stored.len() != 64 {
        return Err(Error::PasswordIncorrect);
    }
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&stored[..16]);
    let expected = crypto.encrypt_with_iv(sign, &iv)?;
    if expected.as_slice() != &stored[16..] {
        return Err(Error::PasswordIncorrect);
    }
    Ok(())
}
