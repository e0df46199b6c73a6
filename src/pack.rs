//! Packing pipeline: staging index in, version 20 package out.
//!
//! ```text
//! offset 0          148                                          EOF
//!        | header  | file blocks ... | detail | index |
//! ```
//!
//! The header depends on every other section's offset and size, so a zeroed
//! placeholder is written first and overwritten once the index is down.
//! Output must therefore be seekable.  A failure or cancellation leaves the
//! partial output in place.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::Utc;

use crate::block::{is_valid_block_size, BLOCK_SIZE_ALIGN, DEFAULT_BLOCK_SIZE};
use crate::crypto::{create_password_check, Password, PzCrypto, StreamStatus, MAX_BUFFER_SIZE};
use crate::detail::{encode_detail, PzDetail};
use crate::error::{Error, Result};
use crate::header::{write_header, FormatVersion, PzHeader, PzType, HEADER_SIZE};
use crate::index::{
    encode_index, FileSource, IndexError, IndexTree, PzFile, PzFolder, StagedFile, StagingIndex, ROOT_ID,
};
use crate::progress::{self, CancelToken, ProgressSink, ProgressState};
use crate::transform::{renamed, ContentTransform};

// ── PackOptions ─────────────────────────────────────────────────────────────

/// Configuration for [`Packer`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub password:    Password,
    /// Plain bytes per encrypted block.  Positive multiple of 64 KiB.
    pub block_size:  u32,
    pub name:        String,
    pub description: String,
    pub tags:        Vec<String>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            password:    Password::new(""),
            block_size:  DEFAULT_BLOCK_SIZE,
            name:        String::new(),
            description: String::new(),
            tags:        Vec::new(),
        }
    }
}

impl PackOptions {
    pub fn new(password: impl Into<Password>, name: impl Into<String>) -> Self {
        Self { password: password.into(), name: name.into(), ..Self::default() }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.password.is_blank() {
            return Err(Error::InvalidOption { option: "password", reason: "must not be blank".into() });
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidOption { option: "name", reason: "must not be blank".into() });
        }
        if !is_valid_block_size(self.block_size) {
            return Err(Error::InvalidOption {
                option: "block size",
                reason: format!(
                    "{} is not a positive multiple of {BLOCK_SIZE_ALIGN} up to {MAX_BUFFER_SIZE}",
                    self.block_size
                ),
            });
        }
        Ok(())
    }

    fn detail(&self) -> PzDetail {
        PzDetail::new(self.name.clone(), self.description.clone(), self.tags.clone())
    }
}

/// Terminal state of a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    Completed { total_size: u64 },
    /// Stopped by the cancel token; the output is incomplete.
    Cancelled { files_written: u64 },
}

// ── Packer ──────────────────────────────────────────────────────────────────

pub struct Packer<'a> {
    options:   PackOptions,
    transform: Option<&'a dyn ContentTransform>,
    progress:  Option<&'a mut dyn ProgressSink>,
    cancel:    Option<CancelToken>,
}

/// Output sections gathered while content is written.
#[derive(Default)]
struct Written {
    files:   Vec<PzFile>,
    folders: Vec<PzFolder>,
    seen:    HashSet<u32>,
}

impl Written {
    /// Materialize `pid` and every ancestor not yet recorded.
    fn ensure_folder(&mut self, index: &StagingIndex, mut pid: u32) -> Result<()> {
        while pid != ROOT_ID && self.seen.insert(pid) {
            let folder = index.get_folder(pid)?;
            self.folders.push(PzFolder::new(folder.name.clone(), folder.id, folder.pid));
            pid = folder.pid;
        }
        Ok(())
    }
}

fn report(sink: &mut Option<&mut dyn ProgressSink>, state: &ProgressState) {
    if let Some(sink) = sink.as_deref_mut() {
        sink.report(state);
    }
}

fn open_source(file: &StagedFile) -> Result<Box<dyn Read + '_>> {
    file.source.open().map_err(|e| match (&file.source, e.kind()) {
        (FileSource::Path(path), io::ErrorKind::NotFound) => Error::SourceNotFound { path: path.clone() },
        _ => Error::Io(e),
    })
}

impl<'a> Packer<'a> {
    pub fn new(options: PackOptions) -> Self {
        Self { options, transform: None, progress: None, cancel: None }
    }

    pub fn transform(mut self, transform: &'a dyn ContentTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn progress(mut self, sink: &'a mut dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// Create `path` (which must not exist) and pack into it.
    pub fn pack_to_path(&mut self, path: &Path, index: &StagingIndex) -> Result<PackOutcome> {
        PzType::Package.check_extension(path)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::OutputAlreadyExists { path: path.to_path_buf() },
                _ => Error::Io(e),
            })?;
        let mut writer = BufWriter::new(file);
        let outcome = self.pack(&mut writer, index)?;
        writer.flush()?;
        Ok(outcome)
    }

    /// Stored name of every file in index order, with the transform to
    /// apply.  Fails before anything is written if a renamed file would
    /// share its name with a sibling.
    fn stored_names(&self, index: &StagingIndex) -> Result<Vec<(String, Option<&'a dyn ContentTransform>)>> {
        let mut taken = HashSet::new();
        let mut plan = Vec::with_capacity(index.files_count());
        for file in index.all_files() {
            let transform = self.transform.filter(|t| t.qualifies(file));
            let name = match transform {
                Some(t) => renamed(&file.name, t.extension()),
                None    => file.name.clone(),
            };
            if !taken.insert((file.pid, name.clone())) {
                return Err(IndexError::DuplicateName { name, parent: file.pid }.into());
            }
            plan.push((name, transform));
        }
        Ok(plan)
    }

    /// Pack `index` into `writer`, starting at offset 0.
    pub fn pack<W: Write + Seek>(&mut self, writer: &mut W, index: &StagingIndex) -> Result<PackOutcome> {
        self.options.validate()?;
        if index.is_empty() {
            return Err(Error::EmptyIndex);
        }
        let block_size = self.options.block_size;
        let key = self.options.password.derive_key();
        let crypto = PzCrypto::for_version(FormatVersion::V20, &key, block_size)?;
        let cancel = self.cancel.as_ref();
        let plan = self.stored_names(index)?;

        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&[0u8; HEADER_SIZE as usize])?;
        let mut cursor = HEADER_SIZE;

        // ── Content ─────────────────────────────────────────────────────────
        let mut state = ProgressState::new(index.files_count() as u64, index.sum_files_size());
        let mut out = Written::default();

        for (file, (name, transform)) in index.all_files().iter().zip(plan) {
            if progress::is_cancelled(cancel) {
                return Ok(PackOutcome::Cancelled { files_written: state.processed_files });
            }
            let source = open_source(file)?;
            let (mut reader, expected): (Box<dyn Read + '_>, u64) = match transform {
                Some(t) => {
                    let transformed = t.transform(file, source)?;
                    (transformed.reader, transformed.len.unwrap_or(file.size))
                }
                None => (source, file.size),
            };

            state.begin_file(expected);
            let base = state.processed_bytes;
            let sink = &mut self.progress;
            let status = crypto.encrypt_stream(
                &mut reader,
                writer,
                &mut |n| {
                    state.current_processed_bytes += n;
                    state.processed_bytes = base + state.current_processed_bytes.min(file.size);
                    report(sink, &state);
                },
                cancel,
            )?;

            let (plain, stored) = match status {
                StreamStatus::Finished { plain, stored } => (plain, stored),
                StreamStatus::Cancelled => {
                    return Ok(PackOutcome::Cancelled { files_written: state.processed_files });
                }
            };
            out.files.push(PzFile {
                name,
                id:          file.id,
                pid:         file.pid,
                offset:      cursor,
                size:        stored,
                origin_size: plain,
            });
            out.ensure_folder(index, file.pid)?;
            cursor += stored;

            if progress::is_cancelled(cancel) {
                return Ok(PackOutcome::Cancelled { files_written: state.processed_files });
            }
            state.processed_bytes = base + file.size;
            state.finish_file();
            report(&mut self.progress, &state);
            log::debug!("packed {} ({} -> {} bytes at {})", file.name, plain, stored, cursor - stored);
        }

        // ── Detail ──────────────────────────────────────────────────────────
        let detail = crypto.encrypt(&encode_detail(&self.options.detail()))?;
        writer.write_all(&detail)?;
        let detail_offset = cursor;
        cursor += detail.len() as u64;

        // ── Index ───────────────────────────────────────────────────────────
        let index_bytes = crypto.encrypt(&encode_index(&out.folders, &out.files))?;
        writer.write_all(&index_bytes)?;
        let index_offset = cursor;
        cursor += index_bytes.len() as u64;
        log::debug!(
            "detail {}+{}, index {}+{} ({} folders, {} files)",
            detail_offset, detail.len(), index_offset, index_bytes.len(),
            out.folders.len(), out.files.len()
        );

        // ── Header ──────────────────────────────────────────────────────────
        let sign = PzType::Package.signature();
        let header = PzHeader {
            version:        FormatVersion::V20,
            pz_type:        PzType::Package,
            sign,
            password_check: create_password_check(&crypto, &sign)?,
            create_time:    Some(Utc::now().naive_utc()),
            file_size:      cursor,
            block_size,
            detail_offset,
            detail_size:    section_size(detail.len())?,
            index_offset,
            index_size:     section_size(index_bytes.len())?,
        };
        writer.seek(SeekFrom::Start(0))?;
        write_header(&mut *writer, &header)?;
        writer.seek(SeekFrom::Start(cursor))?;
        writer.flush()?;

        log::info!("packed {} files into {} bytes", out.files.len(), cursor);
        Ok(PackOutcome::Completed { total_size: cursor })
    }
}

fn section_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::format("index", format!("section of {len} bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::encrypted_block_size;
    use std::io::Cursor;

    fn staged(files: &[(&str, usize)]) -> StagingIndex {
        let mut index = StagingIndex::new();
        let dir = index.add_folder("dir", ROOT_ID).unwrap();
        for (name, len) in files {
            index.add_file(FileSource::from(vec![7u8; *len]), name, dir).unwrap();
        }
        index
    }

    #[test]
    fn options_are_validated() {
        assert!(PackOptions::new("pw", "name").validate().is_ok());
        assert!(matches!(
            PackOptions::new(" ", "name").validate(),
            Err(Error::InvalidOption { option: "password", .. })
        ));
        assert!(matches!(
            PackOptions::new("pw", "").validate(),
            Err(Error::InvalidOption { option: "name", .. })
        ));
        assert!(PackOptions::new("pw", "n").with_block_size(100_000).validate().is_err());
        assert!(PackOptions::new("pw", "n").with_block_size(0).validate().is_err());
    }

    #[test]
    fn empty_index_is_refused() {
        let mut out = Cursor::new(Vec::new());
        let result = Packer::new(PackOptions::new("pw", "n")).pack(&mut out, &StagingIndex::new());
        assert!(matches!(result, Err(Error::EmptyIndex)));
    }

    #[test]
    fn layout_offsets_add_up() {
        let index = staged(&[("a", 10), ("b", 65536 + 1)]);
        let mut out = Cursor::new(Vec::new());
        let outcome = Packer::new(PackOptions::new("pw", "n").with_block_size(65536))
            .pack(&mut out, &index)
            .unwrap();

        let content = encrypted_block_size(10) + encrypted_block_size(65536) + encrypted_block_size(1);
        let bytes = out.into_inner();
        let PackOutcome::Completed { total_size } = outcome else { panic!("cancelled") };
        assert_eq!(total_size, bytes.len() as u64);

        let header = PzHeader::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(header.detail_offset, HEADER_SIZE + content as u64);
        assert_eq!(header.index_offset, header.detail_offset + header.detail_size as u64);
        assert_eq!(header.file_size, bytes.len() as u64);
        assert_eq!(header.index_offset + header.index_size as u64, header.file_size);
    }

    #[test]
    fn progress_reaches_totals() {
        let index = staged(&[("a", 200_000), ("b", 5), ("c", 0)]);
        let mut last = ProgressState::default();
        let mut reports = 0;
        let mut sink = |s: &ProgressState| {
            assert!(s.processed_bytes >= last.processed_bytes);
            last = *s;
            reports += 1;
        };
        Packer::new(PackOptions::new("pw", "n").with_block_size(65536))
            .progress(&mut sink)
            .pack(&mut Cursor::new(Vec::new()), &index)
            .unwrap();
        assert_eq!(last.processed_files, 3);
        assert_eq!(last.processed_bytes, 200_005);
        assert_eq!(last.bytes, 200_005);
        // 4 + 1 + 0 blocks, then one report per file.
        assert_eq!(reports, 5 + 3);
    }
}
