//! Crate-wide error type.
//!
//! Lower layers own their own `thiserror` enums ([`CryptoError`],
//! [`IndexError`]); everything surfaces to callers as [`Error`].  Every
//! variant carries the ids, names, versions or sizes needed to build a
//! message without going back to the container.
//!
//! Cancellation is never an error: pack and extract operations report it
//! through their outcome enums.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::header::PzType;
use crate::index::IndexError;
use crate::transform::TransformError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported container version: {version}")]
    VersionUnsupported { version: u32 },

    #[error("File type mismatch: expected {expected}, found {found}")]
    FileTypeMismatch { expected: PzType, found: String },

    #[error("Password incorrect")]
    PasswordIncorrect,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Index contains no files")]
    EmptyIndex,

    #[error("Output already exists: {}", path.display())]
    OutputAlreadyExists { path: PathBuf },

    #[error("Source file not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Note content is {actual} bytes, maximum is {max}")]
    NoteTooLarge { max: usize, actual: usize },

    #[error("Invalid {option}: {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error("Malformed {section} section: {reason}")]
    Format { section: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn format(section: &'static str, reason: impl Into<String>) -> Self {
        Error::Format { section, reason: reason.into() }
    }
}
