//! Per-file content transforms applied while packing.
//!
//! A transform (an image re-encoder, for instance) sees each staged file
//! and decides whether it qualifies.  A qualifying file's source is handed
//! to [`ContentTransform::transform`], and the stream it returns is
//! encrypted block by block in place of the source.  If
//! [`ContentTransform::extension`] returns an extension, the stored file
//! name is changed to it.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::index::StagedFile;

#[derive(Error, Debug)]
#[error("Transform of '{name}' failed: {reason}")]
pub struct TransformError {
    pub name:   String,
    pub reason: String,
}

/// Stream produced by a transform.
pub struct Transformed<'s> {
    pub reader: Box<dyn Read + 's>,
    /// Length of `reader` when known up front; used for progress.
    pub len:    Option<u64>,
}

impl<'s> Transformed<'s> {
    pub fn new(reader: impl Read + 's) -> Self {
        Self { reader: Box::new(reader), len: None }
    }

    pub fn with_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }
}

pub trait ContentTransform: Send + Sync {
    /// True if `file` should go through [`ContentTransform::transform`].
    fn qualifies(&self, file: &StagedFile) -> bool;

    /// Wrap `source` in the stream whose bytes are stored for `file`.
    fn transform<'s>(
        &'s self,
        file: &'s StagedFile,
        source: Box<dyn Read + 's>,
    ) -> Result<Transformed<'s>, TransformError>;

    /// Extension (without the dot) given to transformed files, if it changes.
    fn extension(&self) -> Option<&str> {
        None
    }
}

/// Name under which a transformed file is stored.
pub fn renamed(name: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => Path::new(name).with_extension(ext).to_string_lossy().into_owned(),
        None      => name.to_owned(),
    }
}
