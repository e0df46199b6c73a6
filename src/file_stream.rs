//! Random access to one file of a block-format container.
//!
//! [`PzFileStream`] exposes the plaintext of a [`PzFile`] through
//! `Read + Seek`.  Only the block under the cursor is decrypted; it stays
//! cached until the cursor leaves it.

use std::io::{self, Read, Seek, SeekFrom};

use crate::block::{encrypted_block_size, BlockLayout};
use crate::crypto::PzCrypto;
use crate::error::{Error, Result};
use crate::index::PzFile;

pub struct PzFileStream<'a, R: Read + Seek> {
    reader:     &'a mut R,
    crypto:     &'a PzCrypto,
    file:       PzFile,
    block_size: u64,
    stored:     BlockLayout,
    position:   u64,
    /// Index and plaintext of the last decrypted block.
    cached:     Option<(u64, Vec<u8>)>,
    scratch:    Vec<u8>,
}

impl<'a, R: Read + Seek> PzFileStream<'a, R> {
    /// Fails with `VersionUnsupported` unless `crypto` works in block mode.
    pub fn new(reader: &'a mut R, crypto: &'a PzCrypto, file: PzFile) -> Result<Self> {
        let block_size = crypto.block_size().ok_or(Error::VersionUnsupported {
            version: crypto.version().as_u32(),
        })?;
        Ok(Self {
            reader,
            crypto,
            stored: BlockLayout::encrypted(file.size, block_size),
            file,
            block_size: block_size as u64,
            position: 0,
            cached: None,
            scratch: Vec::new(),
        })
    }

    pub fn file(&self) -> &PzFile {
        &self.file
    }

    /// Plain length of the file.
    pub fn len(&self) -> u64 {
        self.file.origin_size
    }

    pub fn is_empty(&self) -> bool {
        self.file.origin_size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn load_block(&mut self, index: u64) -> Result<&[u8]> {
        let hit = matches!(&self.cached, Some((cached, _)) if *cached == index);
        if !hit {
            let stored_len = self.stored.block_len(index) as usize;
            let offset = self.file.offset + self.stored.block_offset(index);
            self.scratch.resize(stored_len, 0);
            self.reader.seek(SeekFrom::Start(offset))?;
            self.reader.read_exact(&mut self.scratch).map_err(|_| {
                Error::format("content", format!("block {index} of '{}' is truncated", self.file.name))
            })?;

            let mut plain = match self.cached.take() {
                Some((_, buf)) => buf,
                None => Vec::with_capacity(encrypted_block_size(self.block_size as usize)),
            };
            plain.resize(stored_len, 0);
            let n = self.crypto.decrypt_into(&self.scratch, &mut plain)?;
            plain.truncate(n);
            self.cached = Some((index, plain));
        }
        match &self.cached {
            Some((_, plain)) => Ok(plain),
            None => Err(Error::format("content", "block cache is empty")),
        }
    }
}

impl<R: Read + Seek> Read for PzFileStream<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.len() {
            return Ok(0);
        }
        let index  = self.position / self.block_size;
        let within = (self.position % self.block_size) as usize;
        let plain = self
            .load_block(index)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if within >= plain.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {index} ends before offset {within}"),
            ));
        }
        let n = buf.len().min(plain.len() - within);
        buf[..n].copy_from_slice(&plain[within..within + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for PzFileStream<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n)   => Some(n),
            SeekFrom::End(d)     => self.len().checked_add_signed(d),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
        };
        match target {
            Some(n) => {
                self.position = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}
