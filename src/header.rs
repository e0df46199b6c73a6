//! Container header — the fixed-size block at offset 0.
//!
//! Six historical layouts are readable; only the current one (version 20)
//! is ever written.  All integers are little-endian.
//!
//! | Version | Fields after the version tag |
//! |---------|------------------------------|
//! | 1, 2, 4 | sign(32) pwHash(32) detailLen(4)+bytes indexOffset(8) |
//! | 11      | sign(32) pwHash(32) created(8) fileSize(8) blockSize(4) indexSize(4) |
//! | 12      | sign(32) pwHash(32) created(8) fileSize(8) blockSize(4) indexOffset(8) |
//! | 20      | type(4) sign(32) pwCheck(64) created(8) fileSize(8) blockSize(4) detailOffset(8) detailSize(4) indexOffset(8) indexSize(4) |
//!
//! Version 11 has no index offset field: its index always starts right
//! after the 92-byte header.  Versions 1/2/4/12 have no index size field:
//! the index runs to the end of the file.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Version written by this implementation.
pub const CURRENT_VERSION: u32 = 20;
/// On-disk size of a version 20 header.
pub const HEADER_SIZE: u64 = 148;
/// Fixed index position of version 11 containers (= size of the v11 header).
pub const V11_INDEX_OFFSET: u64 = 92;

pub const PACKAGE_EXTENSION: &str = "pzpk";
pub const NOTE_EXTENSION:    &str = "pznt";

const TICKS_PER_SECOND: i64 = 10_000_000;
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_MASK:       i64 = 0x3FFF_FFFF_FFFF_FFFF;

// ── FormatVersion ───────────────────────────────────────────────────────────

/// Every on-disk format this crate can read.  Unknown values never convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FormatVersion {
    V1,
    V2,
    V4,
    V11,
    V12,
    V20,
}

impl FormatVersion {
    pub fn as_u32(self) -> u32 {
        match self {
            FormatVersion::V1  => 1,
            FormatVersion::V2  => 2,
            FormatVersion::V4  => 4,
            FormatVersion::V11 => 11,
            FormatVersion::V12 => 12,
            FormatVersion::V20 => 20,
        }
    }

    /// Versions whose content is split into independently encrypted blocks.
    pub fn is_block_format(self) -> bool {
        matches!(self, FormatVersion::V11 | FormatVersion::V12 | FormatVersion::V20)
    }

    /// Versions that persist a detail section.
    pub fn has_detail(self) -> bool {
        self == FormatVersion::V20
    }

    /// Versions whose password check is an encrypted signature rather than
    /// a key hash.
    pub fn uses_signature_check(self) -> bool {
        self == FormatVersion::V20
    }
}

impl TryFrom<u32> for FormatVersion {
    type Error = Error;

    fn try_from(version: u32) -> Result<Self> {
        match version {
            1  => Ok(FormatVersion::V1),
            2  => Ok(FormatVersion::V2),
            4  => Ok(FormatVersion::V4),
            11 => Ok(FormatVersion::V11),
            12 => Ok(FormatVersion::V12),
            20 => Ok(FormatVersion::V20),
            _  => Err(Error::VersionUnsupported { version }),
        }
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

// ── PzType ──────────────────────────────────────────────────────────────────

/// What a container holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PzType {
    Package,
    Note,
}

impl PzType {
    pub fn as_u32(self) -> u32 {
        match self {
            PzType::Package => 1,
            PzType::Note    => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(PzType::Package),
            2 => Some(PzType::Note),
            _ => None,
        }
    }

    pub fn type_id_text(self) -> &'static str {
        match self {
            PzType::Package => "PZPK-Package",
            PzType::Note    => "PZPK-Note",
        }
    }

    /// SHA-256 of the type id text; stored in the header as `sign`.
    pub fn signature(self) -> [u8; 32] {
        Sha256::digest(self.type_id_text().as_bytes()).into()
    }

    pub fn extension(self) -> &'static str {
        match self {
            PzType::Package => PACKAGE_EXTENSION,
            PzType::Note    => NOTE_EXTENSION,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            PACKAGE_EXTENSION => Some(PzType::Package),
            NOTE_EXTENSION    => Some(PzType::Note),
            _                 => None,
        }
    }

    /// Fail with `FileTypeMismatch` when `path` carries the extension of
    /// another container type.  Unrecognised extensions pass.
    pub fn check_extension(self, path: &Path) -> Result<()> {
        let found = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(PzType::from_extension);
        match found {
            Some(t) if t != self => Err(Error::FileTypeMismatch {
                expected: self,
                found:    t.type_id_text().to_owned(),
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for PzType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_id_text())
    }
}

// ── PzHeader ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PzHeader {
    pub version:        FormatVersion,
    pub pz_type:        PzType,
    #[serde(skip)]
    pub sign:           [u8; 32],
    /// 32-byte key hash (legacy) or 64-byte IV + encrypted signature (v20).
    #[serde(skip)]
    pub password_check: Vec<u8>,
    /// `None` for versions that did not record it.
    pub create_time:    Option<NaiveDateTime>,
    pub file_size:      u64,
    pub block_size:     u32,
    pub detail_offset:  u64,
    pub detail_size:    u32,
    pub index_offset:   u64,
    pub index_size:     u32,
}

impl PzHeader {
    /// Read and version-dispatch the header at the start of `reader`.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let stream_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let raw_version = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let version = FormatVersion::try_from(raw_version)?;

        let header = match version {
            FormatVersion::V1 | FormatVersion::V2 | FormatVersion::V4 => {
                read_legacy(reader, version, stream_len)
            }
            FormatVersion::V11 => read_v11(reader),
            FormatVersion::V12 => read_v12(reader, stream_len),
            FormatVersion::V20 => read_v20(reader),
        }
        .map_err(truncated)?;

        header.validate(stream_len)?;
        log::debug!(
            "header v{} {}: index {}+{}, detail {}+{}, block {}",
            header.version, header.pz_type, header.index_offset, header.index_size,
            header.detail_offset, header.detail_size, header.block_size,
        );
        Ok(header)
    }

    /// Write the version 20 layout.  Always exactly [`HEADER_SIZE`] bytes.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        if self.version != FormatVersion::V20 {
            return Err(Error::VersionUnsupported { version: self.version.as_u32() });
        }
        if self.password_check.len() != 64 {
            return Err(Error::format("header", format!(
                "password check must be 64 bytes, got {}", self.password_check.len()
            )));
        }
        let created = self.create_time.map(datetime_to_ticks).unwrap_or(0);

        writer.write_u32::<LittleEndian>(CURRENT_VERSION)?;
        writer.write_u32::<LittleEndian>(self.pz_type.as_u32())?;
        writer.write_all(&self.sign)?;
        writer.write_all(&self.password_check)?;
        writer.write_i64::<LittleEndian>(created)?;
        writer.write_u64::<LittleEndian>(self.file_size)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_u64::<LittleEndian>(self.detail_offset)?;
        writer.write_u32::<LittleEndian>(self.detail_size)?;
        writer.write_u64::<LittleEndian>(self.index_offset)?;
        writer.write_u32::<LittleEndian>(self.index_size)?;
        Ok(())
    }

    /// Fail with `FileTypeMismatch` unless the header declares `expected`.
    pub fn expect_type(&self, expected: PzType) -> Result<()> {
        if self.pz_type != expected {
            return Err(Error::FileTypeMismatch {
                expected,
                found: self.pz_type.type_id_text().to_owned(),
            });
        }
        Ok(())
    }

    fn validate(&self, stream_len: u64) -> Result<()> {
        let index_end = self.index_offset.checked_add(self.index_size as u64);
        if index_end.map_or(true, |end| end > stream_len) {
            return Err(Error::format("header", format!(
                "index {}+{} lies outside the {stream_len}-byte file",
                self.index_offset, self.index_size
            )));
        }
        if self.version.has_detail() {
            let detail_end = self.detail_offset.checked_add(self.detail_size as u64);
            if detail_end.map_or(true, |end| end > stream_len) {
                return Err(Error::format("header", format!(
                    "detail {}+{} lies outside the {stream_len}-byte file",
                    self.detail_offset, self.detail_size
                )));
            }
        }
        if self.file_size != stream_len {
            log::warn!(
                "header declares {} bytes but the file is {stream_len} bytes",
                self.file_size
            );
        }
        Ok(())
    }
}

/// Read the header at the start of `reader`.  See [`PzHeader::read`].
pub fn read_header<R: Read + Seek>(reader: &mut R) -> Result<PzHeader> {
    PzHeader::read(reader)
}

/// Write `header` in the version 20 layout.
pub fn write_header<W: Write>(writer: W, header: &PzHeader) -> Result<()> {
    header.write(writer)
}

// ── Per-version readers ─────────────────────────────────────────────────────

fn read_array<const N: usize, R: Read>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn tail_size(stream_len: u64, offset: u64) -> io::Result<u32> {
    stream_len
        .checked_sub(offset)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| io::Error::new(
            io::ErrorKind::InvalidData,
            format!("index offset {offset} exceeds file length {stream_len}"),
        ))
}

fn read_legacy<R: Read>(reader: &mut R, version: FormatVersion, stream_len: u64) -> io::Result<PzHeader> {
    let sign: [u8; 32] = read_array(reader)?;
    let pw_hash: [u8; 32] = read_array(reader)?;

    // Unused legacy detail blob.
    let detail_len = reader.read_u32::<LittleEndian>()?;
    io::copy(&mut reader.by_ref().take(detail_len as u64), &mut io::sink())?;
    let index_offset = reader.read_u64::<LittleEndian>()?;

    Ok(PzHeader {
        version,
        pz_type:        PzType::Package,
        sign,
        password_check: pw_hash.to_vec(),
        create_time:    None,
        file_size:      stream_len,
        block_size:     0,
        detail_offset:  0,
        detail_size:    0,
        index_offset,
        index_size:     tail_size(stream_len, index_offset)?,
    })
}

fn read_v11<R: Read>(reader: &mut R) -> io::Result<PzHeader> {
    let sign: [u8; 32] = read_array(reader)?;
    let pw_hash: [u8; 32] = read_array(reader)?;
    let created    = reader.read_i64::<LittleEndian>()?;
    let file_size  = reader.read_u64::<LittleEndian>()?;
    let block_size = reader.read_u32::<LittleEndian>()?;
    let index_size = reader.read_u32::<LittleEndian>()?;

    Ok(PzHeader {
        version:        FormatVersion::V11,
        pz_type:        PzType::Package,
        sign,
        password_check: pw_hash.to_vec(),
        create_time:    ticks_to_datetime(created),
        file_size,
        block_size,
        detail_offset:  0,
        detail_size:    0,
        index_offset:   V11_INDEX_OFFSET,
        index_size,
    })
}

fn read_v12<R: Read>(reader: &mut R, stream_len: u64) -> io::Result<PzHeader> {
    let sign: [u8; 32] = read_array(reader)?;
    let pw_hash: [u8; 32] = read_array(reader)?;
    let created      = reader.read_i64::<LittleEndian>()?;
    let file_size    = reader.read_u64::<LittleEndian>()?;
    let block_size   = reader.read_u32::<LittleEndian>()?;
    let index_offset = reader.read_u64::<LittleEndian>()?;

    Ok(PzHeader {
        version:        FormatVersion::V12,
        pz_type:        PzType::Package,
        sign,
        password_check: pw_hash.to_vec(),
        create_time:    ticks_to_datetime(created),
        file_size,
        block_size,
        detail_offset:  0,
        detail_size:    0,
        index_offset,
        index_size:     tail_size(stream_len, index_offset)?,
    })
}

fn read_v20<R: Read>(reader: &mut R) -> io::Result<PzHeader> {
    let raw_type = reader.read_u32::<LittleEndian>()?;
    let pz_type = PzType::from_u32(raw_type).ok_or_else(|| io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unknown container type {raw_type}"),
    ))?;
    let sign: [u8; 32] = read_array(reader)?;
    let check: [u8; 64] = read_array(reader)?;

    Ok(PzHeader {
        version:        FormatVersion::V20,
        pz_type,
        sign,
        password_check: check.to_vec(),
        create_time:    ticks_to_datetime(reader.read_i64::<LittleEndian>()?),
        file_size:      reader.read_u64::<LittleEndian>()?,
        block_size:     reader.read_u32::<LittleEndian>()?,
        detail_offset:  reader.read_u64::<LittleEndian>()?,
        detail_size:    reader.read_u32::<LittleEndian>()?,
        index_offset:   reader.read_u64::<LittleEndian>()?,
        index_size:     reader.read_u32::<LittleEndian>()?,
    })
}

pub(crate) fn truncated(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::format("header", "truncated header"),
        io::ErrorKind::InvalidData   => Error::format("header", e.to_string()),
        _                            => Error::Io(e),
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// Decode 100 ns ticks since 0001-01-01 (kind bits in the top two bits are
/// ignored).  Zero means "not recorded".
pub fn ticks_to_datetime(raw: i64) -> Option<NaiveDateTime> {
    let ticks = raw & TICKS_MASK;
    if ticks == 0 {
        return None;
    }
    let since_epoch = ticks - UNIX_EPOCH_TICKS;
    let secs  = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

pub fn datetime_to_ticks(dt: NaiveDateTime) -> i64 {
    let utc = dt.and_utc();
    utc.timestamp() * TICKS_PER_SECOND
        + (utc.timestamp_subsec_nanos() / 100) as i64
        + UNIX_EPOCH_TICKS
}
