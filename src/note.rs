//! Note containers (`.pznt`): a password-protected list of short texts.
//!
//! ```text
//! offset 0     124
//!        | hdr | note 1 | note 2 | ... | index |
//! ```
//!
//! Header (124 bytes): version(4)=20 type(4)=Note sign(32) pwCheck(64)
//! savedTime(8) fileSize(4) indexOffset(4) indexSize(4).
//!
//! Each note body is its UTF-8 content encrypted as one buffer.  The index
//! is one encrypted buffer of entries
//! `[len(4, counts itself)][id(4)][offset(4)][size(4)][title]`.
//! The whole file is rewritten on every save.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{NaiveDateTime, Utc};

use crate::crypto::{create_password_check, derive_key, verify_signature, Password, PzCrypto};
use crate::error::{Error, Result};
use crate::header::{datetime_to_ticks, ticks_to_datetime, truncated, FormatVersion, PzType};
use crate::index::IdCounter;

pub const NOTE_HEADER_SIZE: u64 = 124;
/// Largest note body, in UTF-8 bytes.
pub const MAX_NOTE_SIZE: usize = 64 * 1024;
/// Engine block size for note containers.  Notes are single buffers, so it
/// only has to be valid.
const NOTE_BLOCK_SIZE: u32 = 64 * 1024;
const ENTRY_FIXED: usize = 16;

pub const DEFAULT_NOTE_TITLE: &str = "New Note";

// ── Header ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NoteHeader {
    pub sign:           [u8; 32],
    pub password_check: Vec<u8>,
    pub saved_time:     Option<NaiveDateTime>,
    pub file_size:      u32,
    pub index_offset:   u32,
    pub index_size:     u32,
}

impl NoteHeader {
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let raw_version = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        if FormatVersion::try_from(raw_version)? != FormatVersion::V20 {
            return Err(Error::VersionUnsupported { version: raw_version });
        }
        let raw_type = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        if raw_type != PzType::Note.as_u32() {
            return Err(Error::FileTypeMismatch {
                expected: PzType::Note,
                found:    PzType::from_u32(raw_type)
                    .map_or_else(|| format!("type {raw_type}"), |t| t.type_id_text().to_owned()),
            });
        }

        let mut sign = [0u8; 32];
        let mut check = vec![0u8; 64];
        reader.read_exact(&mut sign).map_err(truncated)?;
        reader.read_exact(&mut check).map_err(truncated)?;
        Ok(Self {
            sign,
            password_check: check,
            saved_time:     ticks_to_datetime(reader.read_i64::<LittleEndian>().map_err(truncated)?),
            file_size:      reader.read_u32::<LittleEndian>().map_err(truncated)?,
            index_offset:   reader.read_u32::<LittleEndian>().map_err(truncated)?,
            index_size:     reader.read_u32::<LittleEndian>().map_err(truncated)?,
        })
    }

    fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(FormatVersion::V20.as_u32())?;
        writer.write_u32::<LittleEndian>(PzType::Note.as_u32())?;
        writer.write_all(&self.sign)?;
        writer.write_all(&self.password_check)?;
        writer.write_i64::<LittleEndian>(self.saved_time.map(datetime_to_ticks).unwrap_or(0))?;
        writer.write_u32::<LittleEndian>(self.file_size)?;
        writer.write_u32::<LittleEndian>(self.index_offset)?;
        writer.write_u32::<LittleEndian>(self.index_size)?;
        Ok(())
    }
}

// ── Note ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    id:      u32,
    title:   String,
    content: String,
}

impl Note {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn update(&mut self, title: impl Into<String>, content: impl Into<String>) {
        self.title = title.into();
        self.content = content.into();
    }

    fn encode(&self) -> Result<&[u8]> {
        let bytes = self.content.as_bytes();
        if bytes.len() > MAX_NOTE_SIZE {
            return Err(Error::NoteTooLarge { max: MAX_NOTE_SIZE, actual: bytes.len() });
        }
        Ok(bytes)
    }
}

// ── NoteBook ────────────────────────────────────────────────────────────────

pub struct NoteBook {
    path:   PathBuf,
    crypto: PzCrypto,
    notes:  Vec<Note>,
    ids:    IdCounter,
}

impl std::fmt::Debug for NoteBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteBook")
            .field("path", &self.path)
            .field("notes", &self.notes.len())
            .finish_non_exhaustive()
    }
}

fn note_engine(password: &Password) -> Result<PzCrypto> {
    if password.is_blank() {
        return Err(Error::InvalidOption { option: "password", reason: "must not be blank".into() });
    }
    PzCrypto::for_version(FormatVersion::V20, &password.derive_key(), NOTE_BLOCK_SIZE)
}

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::format("note", format!("{what} {value} exceeds 4 GiB")))
}

impl NoteBook {
    /// Start an empty notebook to be saved at `path`.  Nothing is written
    /// until [`NoteBook::save`].
    pub fn create(path: impl Into<PathBuf>, password: impl Into<Password>) -> Result<Self> {
        let path = path.into();
        PzType::Note.check_extension(&path)?;
        if path.exists() {
            return Err(Error::OutputAlreadyExists { path });
        }
        Ok(Self { path, crypto: note_engine(&password.into())?, notes: Vec::new(), ids: IdCounter::new(0) })
    }

    pub fn open(path: impl Into<PathBuf>, password: &str) -> Result<Self> {
        let path = path.into();
        PzType::Note.check_extension(&path)?;
        let mut reader = BufReader::new(File::open(&path)?);

        let header = NoteHeader::read(&mut reader)?;
        let crypto = PzCrypto::for_version(FormatVersion::V20, &derive_key(password), NOTE_BLOCK_SIZE)?;
        verify_signature(&crypto, &header.sign, &header.password_check)?;

        let notes = read_notes(&mut reader, &crypto, &header)?;
        let max_id = notes.iter().map(|n| n.id).max().unwrap_or(0);
        log::info!("opened notebook {} with {} notes", path.display(), notes.len());
        Ok(Self { path, crypto, notes, ids: IdCounter::new(max_id) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn get_note(&self, id: u32) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn get_note_mut(&mut self, id: u32) -> Option<&mut Note> {
        self.notes.iter_mut().find(|n| n.id == id)
    }

    /// Append an empty note titled [`DEFAULT_NOTE_TITLE`].
    pub fn add_note(&mut self) -> &mut Note {
        let id = self.ids.next();
        let index = self.notes.len();
        self.notes.push(Note { id, title: DEFAULT_NOTE_TITLE.to_owned(), content: String::new() });
        &mut self.notes[index]
    }

    /// Remove note `id`.  Returns it, or `None` if there was no such note.
    pub fn delete_note(&mut self, id: u32) -> Option<Note> {
        let pos = self.notes.iter().position(|n| n.id == id)?;
        Some(self.notes.remove(pos))
    }

    /// Re-key the notebook.  Takes effect on disk at the next save.
    pub fn change_password(&mut self, password: impl Into<Password>) -> Result<()> {
        self.crypto = note_engine(&password.into())?;
        Ok(())
    }

    /// Rewrite the file at [`NoteBook::path`].
    pub fn save(&self) -> Result<()> {
        // Validate sizes before truncating anything on disk.
        for note in &self.notes {
            note.encode()?;
        }
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let size = self.write_to(&mut writer)?;
        writer.flush()?;
        log::info!("saved {} notes ({size} bytes) to {}", self.notes.len(), self.path.display());
        Ok(())
    }

    /// Serialize the notebook into `writer` from offset 0.  Returns the
    /// total length.
    pub fn write_to<W: Write + Seek>(&self, writer: &mut W) -> Result<u64> {
        writer.seek(SeekFrom::Start(NOTE_HEADER_SIZE))?;
        let mut cursor = NOTE_HEADER_SIZE;
        let mut index = Vec::new();

        for note in &self.notes {
            let body = self.crypto.encrypt(note.encode()?)?;
            writer.write_all(&body)?;
            let title = note.title.as_bytes();
            index.extend_from_slice(&((ENTRY_FIXED + title.len()) as u32).to_le_bytes());
            index.extend_from_slice(&note.id.to_le_bytes());
            index.extend_from_slice(&to_u32(cursor, "note offset")?.to_le_bytes());
            index.extend_from_slice(&(body.len() as u32).to_le_bytes());
            index.extend_from_slice(title);
            cursor += body.len() as u64;
        }

        let index_offset = cursor;
        let index = self.crypto.encrypt(&index)?;
        writer.write_all(&index)?;
        cursor += index.len() as u64;

        let sign = PzType::Note.signature();
        let header = NoteHeader {
            sign,
            password_check: create_password_check(&self.crypto, &sign)?,
            saved_time:     Some(Utc::now().naive_utc()),
            file_size:      to_u32(cursor, "file size")?,
            index_offset:   to_u32(index_offset, "index offset")?,
            index_size:     to_u32(index.len() as u64, "index size")?,
        };
        writer.seek(SeekFrom::Start(0))?;
        header.write(&mut *writer)?;
        writer.seek(SeekFrom::Start(cursor))?;
        Ok(cursor)
    }
}

fn read_notes<R: Read + Seek>(reader: &mut R, crypto: &PzCrypto, header: &NoteHeader) -> Result<Vec<Note>> {
    let index = read_buffer(reader, crypto, header.index_offset, header.index_size, "index")?;
    let mut rdr = Cursor::new(index.as_slice());
    let mut notes = Vec::new();

    while (rdr.position() as usize) < index.len() {
        let start = rdr.position() as usize;
        let len = rdr.read_u32::<LittleEndian>().map_err(|_| Error::format("note", "index entry cut off"))? as usize;
        let end = start.checked_add(len).filter(|&e| len >= ENTRY_FIXED && e <= index.len())
            .ok_or_else(|| Error::format("note", format!("index entry of {len} bytes at {start}")))?;
        let id     = rdr.read_u32::<LittleEndian>()?;
        let offset = rdr.read_u32::<LittleEndian>()?;
        let size   = rdr.read_u32::<LittleEndian>()?;
        let title  = String::from_utf8_lossy(&index[start + ENTRY_FIXED..end]).into_owned();
        rdr.set_position(end as u64);

        let body = read_buffer(reader, crypto, offset, size, "note")?;
        let content = String::from_utf8(body)
            .map_err(|e| Error::format("note", format!("note {id} is not UTF-8: {e}")))?;
        notes.push(Note { id, title, content });
    }
    Ok(notes)
}

fn read_buffer<R: Read + Seek>(
    reader: &mut R,
    crypto: &PzCrypto,
    offset: u32,
    size: u32,
    section: &'static str,
) -> Result<Vec<u8>> {
    let mut stored = vec![0u8; size as usize];
    reader.seek(SeekFrom::Start(offset as u64))?;
    reader
        .read_exact(&mut stored)
        .map_err(|_| Error::format(section, format!("{offset}+{size} is truncated")))?;
    crypto.decrypt(&stored).map_err(|e| Error::format(section, e.to_string()))
}
