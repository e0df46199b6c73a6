//! Hand-built containers in every historical layout.

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use pzpk::crypto::legacy_key_hash;
use pzpk::header::{datetime_to_ticks, ticks_to_datetime};
use pzpk::index::V1_FILE_ID_BASE;
use pzpk::{derive_key, Error, ExtractOutcome, FormatVersion, IndexTree, Package, PzCrypto, ROOT_ID};
use sha2::{Digest, Sha256};
use std::io::Cursor;

const PASSWORD: &str = "legacy-pw";

fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; plain.len() + 16 - plain.len() % 16];
    buf[..plain.len()].copy_from_slice(plain);
    let enc = cbc::Encryptor::<aes::Aes256>::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    let len = enc.encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len()).unwrap().len();
    buf.truncate(len);
    buf
}

fn legacy_iv(key: &[u8; 32]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&Sha256::digest(key)[..16]);
    iv
}

/// Folder entry without a self-counting prefix.
fn legacy_folder(out: &mut Vec<u8>, id: u32, pid: u32, name: &str) {
    out.extend_from_slice(&(8 + name.len() as u32).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

fn legacy_file(out: &mut Vec<u8>, version: u32, pid: u32, offset: u64, size: u64, name: &str) {
    let fixed = if version == 1 { 16 } else { 20 };
    out.extend_from_slice(&(fixed + name.len() as u32).to_le_bytes());
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    if version == 1 {
        out.extend_from_slice(&(size as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&size.to_le_bytes());
    }
    out.extend_from_slice(name.as_bytes());
}

fn index_section(folders: &[u8], files: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(folders.len() as u32).to_le_bytes());
    out.extend_from_slice(&(files.len() as u32).to_le_bytes());
    out.extend_from_slice(folders);
    out.extend_from_slice(files);
    out
}

/// Version 1, 2 or 4 container holding `docs/readme.txt` and `top.bin`.
fn legacy_container(version: u32, readme: &[u8], top: &[u8]) -> Vec<u8> {
    let key = derive_key(PASSWORD);
    let iv = legacy_iv(&key);
    let seal = |plain: &[u8]| -> Vec<u8> {
        if version == 4 {
            let region_iv = [version as u8; 16];
            let mut out = region_iv.to_vec();
            out.extend_from_slice(&cbc_encrypt(&key, &region_iv, plain));
            out
        } else {
            cbc_encrypt(&key, &iv, plain)
        }
    };

    let detail = b"old detail blob";
    let header_len = 4 + 32 + 32 + 4 + detail.len() + 8;
    let readme_enc = seal(readme);
    let top_enc = seal(top);
    let readme_at = header_len as u64;
    let top_at = readme_at + readme_enc.len() as u64;
    let index_at = top_at + top_enc.len() as u64;

    let mut folders = Vec::new();
    legacy_folder(&mut folders, 7, ROOT_ID, "docs");
    let mut files = Vec::new();
    legacy_file(&mut files, version, 7, readme_at, readme_enc.len() as u64, "readme.txt");
    legacy_file(&mut files, version, ROOT_ID, top_at, top_enc.len() as u64, "top.bin");

    let mut out = Vec::new();
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&[0x11; 32]);
    out.extend_from_slice(&legacy_key_hash(&key));
    out.extend_from_slice(&(detail.len() as u32).to_le_bytes());
    out.extend_from_slice(detail);
    out.extend_from_slice(&index_at.to_le_bytes());
    assert_eq!(out.len(), header_len);
    out.extend_from_slice(&readme_enc);
    out.extend_from_slice(&top_enc);
    out.extend_from_slice(&seal(&index_section(&folders, &files)));
    out
}

fn block_file(out: &mut Vec<u8>, id: u32, pid: u32, offset: u64, size: u64, origin: u64, name: &str) {
    out.extend_from_slice(&(36 + name.len() as u32).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&origin.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

/// Version 11 or 12 container with a single file `data.bin` in folder `f`.
fn block_container(version: u32, data: &[u8], block_size: u32, ticks: i64) -> Vec<u8> {
    let key = derive_key(PASSWORD);
    let format = FormatVersion::try_from(version).unwrap();
    let crypto = PzCrypto::for_version(format, &key, block_size).unwrap();
    let mut content = Vec::new();
    crypto.encrypt_stream(&mut Cursor::new(data), &mut content, &mut |_| {}, None).unwrap();

    let header_len: u64 = if version == 11 { 92 } else { 96 };
    let build_index = |content_at: u64| {
        let mut folders = Vec::new();
        folders.extend_from_slice(&(12 + 1u32).to_le_bytes());
        folders.extend_from_slice(&20001u32.to_le_bytes());
        folders.extend_from_slice(&ROOT_ID.to_le_bytes());
        folders.extend_from_slice(b"f");
        let mut files = Vec::new();
        block_file(&mut files, 20002, 20001, content_at, content.len() as u64, data.len() as u64, "data.bin");
        crypto.encrypt(&index_section(&folders, &files)).unwrap()
    };

    let mut out = Vec::new();
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&[0x22; 32]);
    out.extend_from_slice(&legacy_key_hash(&key));
    out.extend_from_slice(&ticks.to_le_bytes());

    if version == 11 {
        // [header][index][content]
        let index_len = build_index(0).len() as u64;
        let index = build_index(header_len + index_len);
        let total = header_len + index.len() as u64 + content.len() as u64;
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&block_size.to_le_bytes());
        out.extend_from_slice(&(index.len() as u32).to_le_bytes());
        assert_eq!(out.len() as u64, header_len);
        out.extend_from_slice(&index);
        out.extend_from_slice(&content);
    } else {
        // [header][content][index]
        let index = build_index(header_len);
        let index_at = header_len + content.len() as u64;
        let total = index_at + index.len() as u64;
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&block_size.to_le_bytes());
        out.extend_from_slice(&index_at.to_le_bytes());
        assert_eq!(out.len() as u64, header_len);
        out.extend_from_slice(&content);
        out.extend_from_slice(&index);
    }
    out
}

#[test]
fn legacy_versions_open_and_extract() {
    let readme = b"read me first, this line is longer than one AES block".to_vec();
    let top: Vec<u8> = (0..70_000u32).map(|i| (i % 241) as u8).collect();

    for version in [1u32, 2, 4] {
        let bytes = legacy_container(version, &readme, &top);
        let mut package = Package::open(Cursor::new(bytes), PASSWORD)
            .unwrap_or_else(|e| panic!("v{version}: {e}"));

        assert_eq!(package.version().as_u32(), version);
        assert!(package.header().create_time.is_none());
        assert_eq!(package.detail().name, "");

        let index = package.index();
        assert_eq!(index.get_folder(7).unwrap().name, "docs");
        let first = index.get_file(V1_FILE_ID_BASE + 1).unwrap().clone();
        let second = index.get_file(V1_FILE_ID_BASE + 2).unwrap().clone();
        assert_eq!(index.full_path(&first).unwrap().to_str(), Some("docs/readme.txt"));
        assert_eq!(first.origin_size, first.size);

        assert_eq!(package.extract_file(&first).unwrap(), readme, "v{version}");
        let mut streamed = Vec::new();
        let outcome = package.extract_file_to_stream(&second, &mut streamed, None, None).unwrap();
        assert_eq!(outcome, ExtractOutcome::Completed { files: 1, bytes: top.len() as u64 });
        assert_eq!(streamed, top, "v{version}");

        assert!(matches!(package.open_file_stream(&second), Err(Error::VersionUnsupported { .. })));
    }
}

#[test]
fn legacy_wrong_password_is_rejected() {
    let bytes = legacy_container(2, b"abc", b"def");
    assert!(matches!(Package::open(Cursor::new(bytes), "nope"), Err(Error::PasswordIncorrect)));
}

#[test]
fn version_11_index_follows_the_header() {
    let data: Vec<u8> = (0..150_000u32).map(|i| (i % 199) as u8).collect();
    let when = ticks_to_datetime(638_400_000_000_000_000).unwrap();
    let bytes = block_container(11, &data, 65536, datetime_to_ticks(when));

    let mut package = Package::open(Cursor::new(bytes), PASSWORD).unwrap();
    assert_eq!(package.version(), FormatVersion::V11);
    assert_eq!(package.header().index_offset, 92);
    assert_eq!(package.header().block_size, 65536);
    assert_eq!(package.header().create_time, Some(when));

    let file = package.index().get_file(20002).unwrap().clone();
    assert_eq!(package.index().full_path(&file).unwrap().to_str(), Some("f/data.bin"));
    assert_eq!(package.extract_file(&file).unwrap(), data);
}

#[test]
fn version_12_index_runs_to_the_end() {
    let data = vec![0xC3u8; 65536 * 2];
    let bytes = block_container(12, &data, 65536, 0);
    let len = bytes.len() as u64;

    let mut package = Package::open(Cursor::new(bytes), PASSWORD).unwrap();
    assert_eq!(package.version(), FormatVersion::V12);
    assert!(package.header().create_time.is_none());
    assert_eq!(package.header().index_offset + package.header().index_size as u64, len);

    let file = package.index().get_file(20002).unwrap().clone();
    assert_eq!(package.extract_file(&file).unwrap(), data);

    let mut stream = package.open_file_stream(&file).unwrap();
    let mut tail = Vec::new();
    std::io::Seek::seek(&mut stream, std::io::SeekFrom::Start(65536 + 10)).unwrap();
    std::io::Read::read_to_end(&mut stream, &mut tail).unwrap();
    assert_eq!(tail.len(), 65536 - 10);
}

#[test]
fn unknown_versions_fail_cleanly() {
    for version in [0u32, 3, 13, 21, u32::MAX] {
        let mut bytes = legacy_container(2, b"abc", b"def");
        bytes[..4].copy_from_slice(&version.to_le_bytes());
        match Package::open(Cursor::new(bytes), PASSWORD) {
            Err(Error::VersionUnsupported { version: v }) => assert_eq!(v, version),
            other => panic!("version {version}: unexpected {:?}", other.map(|_| ())),
        }
    }
}

#[test]
fn truncated_legacy_container_is_a_format_error() {
    let bytes = legacy_container(1, b"abc", b"def");
    let result = Package::open(Cursor::new(bytes[..50].to_vec()), PASSWORD);
    assert!(matches!(result, Err(Error::Format { .. })));
}
