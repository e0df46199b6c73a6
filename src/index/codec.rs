//! Binary layout of the (decrypted) index section.
//!
//! ```text
//! [foldersLen u32][filesLen u32][folder entries][file entries]
//! ```
//!
//! Entries are length-prefixed.  Versions 1/2/4 count only the payload in the
//! prefix; version 11 and later count the 4 prefix bytes as well.
//!
//! | Version | Folder payload     | File payload                                        |
//! |---------|--------------------|-----------------------------------------------------|
//! | 1       | id pid name        | pid offset(8) size(4) name                          |
//! | 2, 4    | id pid name        | pid offset(8) size(8) name                          |
//! | 11+     | id pid name        | id pid offset(8) size(8) originSize(8) name         |
//!
//! Versions 1/2/4 store no file ids; they are numbered from
//! [`V1_FILE_ID_BASE`] + 1 in entry order.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::{IdCounter, PackageIndex, PzFile, PzFolder};
use crate::error::{Error, Result};
use crate::header::FormatVersion;

/// Synthetic id base for files of versions 1, 2 and 4.
pub const V1_FILE_ID_BASE: u32 = 640_000;

const FOLDER_FIXED: usize = 12;
const FILE_FIXED:   usize = 36;

fn malformed(reason: impl Into<String>) -> Error {
    Error::format("index", reason)
}

/// Split a section into entry payloads.
fn split_entries(section: &[u8], prefix_counts_self: bool) -> Result<Vec<&[u8]>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < section.len() {
        let raw = section
            .get(pos..pos + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or_else(|| malformed(format!("entry prefix cut off at byte {pos}")))?;
        let payload = if prefix_counts_self {
            raw.checked_sub(4).ok_or_else(|| malformed(format!("entry length {raw} at byte {pos}")))?
        } else {
            raw
        };
        let start = pos + 4;
        let body = section
            .get(start..start + payload)
            .ok_or_else(|| malformed(format!("entry at byte {pos} runs past the section")))?;
        entries.push(body);
        pos = start + payload;
    }
    Ok(entries)
}

fn name_of(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_folder(body: &[u8]) -> Result<PzFolder> {
    if body.len() < 8 {
        return Err(malformed(format!("folder entry of {} bytes", body.len())));
    }
    let mut rdr = Cursor::new(body);
    let id  = rdr.read_u32::<LittleEndian>()?;
    let pid = rdr.read_u32::<LittleEndian>()?;
    Ok(PzFolder::new(name_of(&body[8..]), id, pid))
}

fn parse_file_legacy(body: &[u8], version: FormatVersion, id: u32) -> Result<PzFile> {
    let fixed = if version == FormatVersion::V1 { 16 } else { 20 };
    if body.len() < fixed {
        return Err(malformed(format!("file entry of {} bytes", body.len())));
    }
    let mut rdr = Cursor::new(body);
    let pid    = rdr.read_u32::<LittleEndian>()?;
    let offset = rdr.read_u64::<LittleEndian>()?;
    let size = if version == FormatVersion::V1 {
        rdr.read_u32::<LittleEndian>()? as u64
    } else {
        rdr.read_u64::<LittleEndian>()?
    };
    Ok(PzFile { name: name_of(&body[fixed..]), id, pid, offset, size, origin_size: size })
}

fn parse_file(body: &[u8]) -> Result<PzFile> {
    if body.len() < FILE_FIXED - 4 {
        return Err(malformed(format!("file entry of {} bytes", body.len())));
    }
    let mut rdr = Cursor::new(body);
    Ok(PzFile {
        id:          rdr.read_u32::<LittleEndian>()?,
        pid:         rdr.read_u32::<LittleEndian>()?,
        offset:      rdr.read_u64::<LittleEndian>()?,
        size:        rdr.read_u64::<LittleEndian>()?,
        origin_size: rdr.read_u64::<LittleEndian>()?,
        name:        name_of(&body[FILE_FIXED - 4..]),
    })
}

/// Parse a decrypted index section written by `version`.
pub fn decode_index(version: FormatVersion, plain: &[u8]) -> Result<PackageIndex> {
    if plain.len() < 8 {
        return Err(malformed(format!("section of {} bytes", plain.len())));
    }
    let folders_len = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize;
    let files_len   = u32::from_le_bytes([plain[4], plain[5], plain[6], plain[7]]) as usize;
    let folders_end = 8usize.saturating_add(folders_len);
    let files_end   = folders_end.saturating_add(files_len);
    if files_end > plain.len() {
        return Err(malformed(format!(
            "declares {folders_len}+{files_len} entry bytes, only {} present",
            plain.len() - 8
        )));
    }
    let folder_section = &plain[8..folders_end];
    let file_section   = &plain[folders_end..files_end];

    let self_counting = version.is_block_format();
    let folders = split_entries(folder_section, self_counting)?
        .into_iter()
        .map(parse_folder)
        .collect::<Result<Vec<_>>>()?;

    let files = if self_counting {
        split_entries(file_section, true)?
            .into_iter()
            .map(parse_file)
            .collect::<Result<Vec<_>>>()?
    } else {
        let mut ids = IdCounter::new(V1_FILE_ID_BASE);
        split_entries(file_section, false)?
            .into_iter()
            .map(|body| parse_file_legacy(body, version, ids.next()))
            .collect::<Result<Vec<_>>>()?
    };

    log::debug!("index v{version}: {} folders, {} files", folders.len(), files.len());
    Ok(PackageIndex::new(folders, files)?)
}

/// Serialize folders and files in the version 11+ layout.
pub fn encode_index(folders: &[PzFolder], files: &[PzFile]) -> Vec<u8> {
    let mut folder_bytes = Vec::new();
    for folder in folders {
        let name = folder.name.as_bytes();
        folder_bytes.extend_from_slice(&((FOLDER_FIXED + name.len()) as u32).to_le_bytes());
        folder_bytes.extend_from_slice(&folder.id.to_le_bytes());
        folder_bytes.extend_from_slice(&folder.pid.to_le_bytes());
        folder_bytes.extend_from_slice(name);
    }

    let mut file_bytes = Vec::new();
    for file in files {
        let name = file.name.as_bytes();
        file_bytes.extend_from_slice(&((FILE_FIXED + name.len()) as u32).to_le_bytes());
        file_bytes.extend_from_slice(&file.id.to_le_bytes());
        file_bytes.extend_from_slice(&file.pid.to_le_bytes());
        file_bytes.extend_from_slice(&file.offset.to_le_bytes());
        file_bytes.extend_from_slice(&file.size.to_le_bytes());
        file_bytes.extend_from_slice(&file.origin_size.to_le_bytes());
        file_bytes.extend_from_slice(name);
    }

    let mut out = Vec::with_capacity(8 + folder_bytes.len() + file_bytes.len());
    out.extend_from_slice(&(folder_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&(file_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&folder_bytes);
    out.extend_from_slice(&file_bytes);
    out
}
