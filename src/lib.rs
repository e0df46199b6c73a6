//! PZPK encrypted containers.
//!
//! A *package* (`.pzpk`) stores a folder/file tree with every file split
//! into independently encrypted AES-256-CBC blocks.  A *notebook* (`.pznt`)
//! stores a list of short texts.  Packages of every historical version
//! (1, 2, 4, 11, 12, 20) can be opened; only version 20 is written.
//!
//! ```no_run
//! use pzpk::{FileSource, Package, PackOptions, Packer, StagingIndex, ROOT_ID, IndexTree};
//! use std::path::Path;
//!
//! let mut index = StagingIndex::new();
//! index.add_file(FileSource::from(b"hello".to_vec()), "hello.txt", ROOT_ID)?;
//! Packer::new(PackOptions::new("secret", "Greetings"))
//!     .pack_to_path(Path::new("greetings.pzpk"), &index)?;
//!
//! let mut package = Package::open_path(Path::new("greetings.pzpk"), "secret")?;
//! let file = package.index().all_files()[0].clone();
//! assert_eq!(package.extract_file(&file)?, b"hello");
//! # Ok::<(), pzpk::Error>(())
//! ```

pub mod block;
pub mod crypto;
pub mod detail;
pub mod error;
pub mod file_stream;
pub mod header;
pub mod index;
pub mod note;
pub mod pack;
pub mod package;
pub mod progress;
pub mod transform;

pub use crypto::{derive_key, Password, PzCrypto};
pub use detail::PzDetail;
pub use error::{Error, Result};
pub use file_stream::PzFileStream;
pub use header::{FormatVersion, PzHeader, PzType, CURRENT_VERSION};
pub use index::{
    FileSource, IndexTree, PackageIndex, PzFile, PzFolder, PzItem, StagingIndex, ROOT_ID,
};
pub use note::{Note, NoteBook};
pub use pack::{PackOptions, PackOutcome, Packer};
pub use package::{ExtractOutcome, Package};
pub use progress::{CancelToken, ProgressSink, ProgressState};
pub use transform::ContentTransform;
