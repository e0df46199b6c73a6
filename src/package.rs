//! Opening and extracting packages.
//!
//! Opening runs strictly in this order, and stops at the first failure:
//!
//! 1. read and version-dispatch the header, check the container type
//! 2. derive the key, build the engine, verify the password
//! 3. decrypt and parse the detail (version 20 only) and the index
//!
//! The password check only ever encrypts, so a wrong password never gets
//! as far as decrypting anything.  File content is decrypted on demand.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::crypto::{verify_legacy, verify_signature, CryptoError, PzCrypto, StreamStatus, MAX_BUFFER_SIZE};
use crate::detail::{decode_detail, PzDetail};
use crate::error::{Error, Result};
use crate::file_stream::PzFileStream;
use crate::header::{read_header, FormatVersion, PzHeader, PzType};
use crate::index::{decode_index, IndexError, IndexTree, PackageIndex, PzFile};
use crate::progress::{self, CancelToken, ProgressSink, ProgressState};

/// Terminal state of a folder or batch extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Completed { files: u64, bytes: u64 },
    /// Stopped by the cancel token.  Files already written stay on disk.
    Cancelled { files: u64 },
}

/// An open package.
pub struct Package<R> {
    reader: R,
    header: PzHeader,
    crypto: PzCrypto,
    detail: PzDetail,
    index:  PackageIndex,
}

impl<R> std::fmt::Debug for Package<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("header", &self.header)
            .field("detail", &self.detail)
            .field("files", &self.index.files_count())
            .finish_non_exhaustive()
    }
}

/// Derive the key for `header` and verify `password` against it.
pub fn unlock(header: &PzHeader, password: &str) -> Result<PzCrypto> {
    let key = crate::crypto::derive_key(password);
    let crypto = PzCrypto::for_version(header.version, &key, header.block_size)?;
    if header.version.uses_signature_check() {
        verify_signature(&crypto, &header.sign, &header.password_check)?;
    } else {
        verify_legacy(&key, &header.password_check)?;
    }
    Ok(crypto)
}

impl Package<BufReader<File>> {
    /// Open the package at `path`.  A `.pznt` extension is refused up front.
    pub fn open_path(path: &Path, password: &str) -> Result<Self> {
        PzType::Package.check_extension(path)?;
        let file = File::open(path)?;
        Package::open(BufReader::new(file), password)
    }
}

impl<R: Read + Seek> Package<R> {
    pub fn read_header(reader: &mut R) -> Result<PzHeader> {
        read_header(reader)
    }

    pub fn open(mut reader: R, password: &str) -> Result<Self> {
        let header = read_header(&mut reader)?;
        header.expect_type(PzType::Package)?;
        let crypto = unlock(&header, password)?;

        let detail = if header.version.has_detail() {
            let plain = read_section(&mut reader, &crypto, "detail", header.detail_offset, header.detail_size)?;
            decode_detail(&plain)?
        } else {
            PzDetail::default()
        };
        let plain = read_section(&mut reader, &crypto, "index", header.index_offset, header.index_size)?;
        let index = decode_index(header.version, &plain)?;

        log::info!(
            "opened v{} package '{}': {} folders, {} files",
            header.version, detail.name, index.all_folders().len(), index.files_count()
        );
        Ok(Self { reader, header, crypto, detail, index })
    }

    pub fn header(&self) -> &PzHeader {
        &self.header
    }

    pub fn detail(&self) -> &PzDetail {
        &self.detail
    }

    pub fn index(&self) -> &PackageIndex {
        &self.index
    }

    pub fn version(&self) -> FormatVersion {
        self.header.version
    }

    pub fn crypto(&self) -> &PzCrypto {
        &self.crypto
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    // ── Single files ────────────────────────────────────────────────────────

    /// Decrypt one stored unit (a buffer written with one IV) at `offset`.
    pub fn extract_buffer(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let length = u32::try_from(length)
            .map_err(|_| CryptoError::InputTooLarge { size: length, max: MAX_BUFFER_SIZE })?;
        read_section(&mut self.reader, &self.crypto, "content", offset, length)
    }

    /// Whole plaintext of `file` in memory.
    pub fn extract_file(&mut self, file: &PzFile) -> Result<Vec<u8>> {
        self.crypto.decrypt_file(&mut self.reader, file)
    }

    /// Stream the plaintext of `file` into `writer`.
    pub fn extract_file_to_stream<W: Write + ?Sized>(
        &mut self,
        file: &PzFile,
        writer: &mut W,
        progress: Option<&mut dyn ProgressSink>,
        cancel: Option<&CancelToken>,
    ) -> Result<ExtractOutcome> {
        if progress::is_cancelled(cancel) {
            return Ok(ExtractOutcome::Cancelled { files: 0 });
        }
        let mut sink = progress;
        let mut state = ProgressState::new(1, file.origin_size);
        state.begin_file(file.origin_size);
        let status = self.crypto.decrypt_region(
            &mut self.reader,
            file.offset,
            file.size,
            writer,
            &mut |n| {
                state.advance(n);
                report(&mut sink, &state);
            },
            cancel,
        )?;
        Ok(single_outcome(status, &mut state, &mut sink))
    }

    /// Write `file` to `destination`, which must not exist yet.  Missing
    /// parent directories are created.  A cancelled extraction leaves the
    /// partial file behind.
    pub fn extract_file_to_path(
        &mut self,
        file: &PzFile,
        destination: &Path,
        progress: Option<&mut dyn ProgressSink>,
        cancel: Option<&CancelToken>,
    ) -> Result<ExtractOutcome> {
        if progress::is_cancelled(cancel) {
            return Ok(ExtractOutcome::Cancelled { files: 0 });
        }
        let mut sink = progress;
        let mut state = ProgressState::new(1, file.origin_size);
        let status = write_file(
            &mut self.reader, &self.crypto, file, destination, &mut state, &mut sink, cancel,
        )?;
        Ok(single_outcome(status, &mut state, &mut sink))
    }

    /// Seekable plaintext view of `file`.  Block-format versions only.
    pub fn open_file_stream(&mut self, file: &PzFile) -> Result<PzFileStream<'_, R>> {
        PzFileStream::new(&mut self.reader, &self.crypto, file.clone())
    }

    // ── Trees ───────────────────────────────────────────────────────────────

    /// Extract the files of `folder` (with `recursive`, of its whole subtree)
    /// below `destination`.  Paths keep the folder's own name unless it is
    /// the root.
    pub fn extract_folder(
        &mut self,
        folder: u32,
        destination: &Path,
        recursive: bool,
        progress: Option<&mut dyn ProgressSink>,
        cancel: Option<&CancelToken>,
    ) -> Result<ExtractOutcome> {
        let files: Vec<PzFile> = self.index.list_files(folder, recursive)?.into_iter().cloned().collect();
        self.extract_files(&files, folder, destination, progress, cancel)
    }

    /// Extract a selection of folders and files that share one parent.
    /// Folders are taken with their whole subtree.
    pub fn extract_batch(
        &mut self,
        items: &[u32],
        destination: &Path,
        progress: Option<&mut dyn ProgressSink>,
        cancel: Option<&CancelToken>,
    ) -> Result<ExtractOutcome> {
        let Some(&first) = items.first() else {
            return Ok(ExtractOutcome::Completed { files: 0, bytes: 0 });
        };
        let parent = self.item_parent(first)?;

        let mut files: Vec<PzFile> = Vec::new();
        let mut seen = HashSet::new();
        for &id in items {
            if self.item_parent(id)? != parent {
                return Err(IndexError::InvalidOperation(format!(
                    "item {id} is not in folder {parent} like item {first}"
                )).into());
            }
            let selected = match self.index.get_file(id) {
                Ok(file) => vec![file],
                Err(_)   => self.index.list_files(id, true)?,
            };
            files.extend(selected.into_iter().filter(|f| seen.insert(f.id)).cloned());
        }
        self.extract_files(&files, parent, destination, progress, cancel)
    }

    fn item_parent(&self, id: u32) -> Result<u32> {
        if let Ok(file) = self.index.get_file(id) {
            return Ok(file.pid);
        }
        Ok(self.index.get_folder(id)?.pid)
    }

    fn extract_files(
        &mut self,
        files: &[PzFile],
        relative_to: u32,
        destination: &Path,
        progress: Option<&mut dyn ProgressSink>,
        cancel: Option<&CancelToken>,
    ) -> Result<ExtractOutcome> {
        fs::create_dir_all(destination)?;
        let mut sink = progress;
        let mut state = ProgressState::new(
            files.len() as u64,
            files.iter().map(|f| f.origin_size).sum(),
        );

        for file in files {
            if progress::is_cancelled(cancel) {
                return Ok(ExtractOutcome::Cancelled { files: state.processed_files });
            }
            let relative = self.index.resolve_path(file, relative_to)?;
            let target = safe_join(destination, &relative)?;
            let status = write_file(
                &mut self.reader, &self.crypto, file, &target, &mut state, &mut sink, cancel,
            )?;
            if status == StreamStatus::Cancelled || progress::is_cancelled(cancel) {
                return Ok(ExtractOutcome::Cancelled { files: state.processed_files });
            }
            state.finish_file();
            report(&mut sink, &state);
        }

        log::info!(
            "extracted {} files ({} bytes) to {}",
            state.processed_files, state.processed_bytes, destination.display()
        );
        Ok(ExtractOutcome::Completed { files: state.processed_files, bytes: state.processed_bytes })
    }
}

fn report(sink: &mut Option<&mut dyn ProgressSink>, state: &ProgressState) {
    if let Some(sink) = sink.as_deref_mut() {
        sink.report(state);
    }
}

fn single_outcome(
    status: StreamStatus,
    state: &mut ProgressState,
    sink: &mut Option<&mut dyn ProgressSink>,
) -> ExtractOutcome {
    match status {
        StreamStatus::Finished { plain, .. } => {
            state.finish_file();
            report(sink, state);
            ExtractOutcome::Completed { files: 1, bytes: plain }
        }
        StreamStatus::Cancelled => ExtractOutcome::Cancelled { files: 0 },
    }
}

/// Read and decrypt one single-buffer section.
fn read_section<R: Read + Seek + ?Sized>(
    reader: &mut R,
    crypto: &PzCrypto,
    section: &'static str,
    offset: u64,
    size: u32,
) -> Result<Vec<u8>> {
    let size = size as usize;
    if size > MAX_BUFFER_SIZE {
        return Err(CryptoError::InputTooLarge { size: size as u64, max: MAX_BUFFER_SIZE }.into());
    }
    let mut stored = vec![0u8; size];
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut stored).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::format(section, format!("{offset}+{size} is truncated")),
        _ => Error::Io(e),
    })?;
    crypto
        .decrypt(&stored)
        .map_err(|e| Error::format(section, e.to_string()))
}

fn write_file<R: Read + Seek + ?Sized>(
    reader: &mut R,
    crypto: &PzCrypto,
    file: &PzFile,
    target: &Path,
    state: &mut ProgressState,
    sink: &mut Option<&mut dyn ProgressSink>,
    cancel: Option<&CancelToken>,
) -> Result<StreamStatus> {
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)?;
    }
    let out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::OutputAlreadyExists { path: target.to_path_buf() },
            _ => Error::Io(e),
        })?;
    let mut out = BufWriter::new(out);

    state.begin_file(file.origin_size);
    let status = crypto.decrypt_region(
        reader,
        file.offset,
        file.size,
        &mut out,
        &mut |n| {
            state.advance(n);
            report(sink, state);
        },
        cancel,
    )?;
    out.flush()?;
    log::debug!("extracted {} -> {}", file.name, target.display());
    Ok(status)
}

/// Join index-derived `relative` onto `root`, refusing anything that could
/// land outside it.
fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            _ => {
                return Err(Error::format("index", format!(
                    "unsafe path '{}'", relative.display()
                )));
            }
        }
    }
    Ok(path)
}
