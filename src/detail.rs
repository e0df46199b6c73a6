//! Descriptive metadata of a package: name, description and tags.
//!
//! Plain layout (encrypted as one buffer in version 20):
//!
//! ```text
//! [nameLen u32][name][descLen u32][desc][tagsLen u32][tags joined by '|']
//! ```
//!
//! Older versions have no detail section; they get [`PzDetail::default`].

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const TAG_SEPARATOR: &str = "|";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PzDetail {
    pub name:        String,
    pub description: String,
    pub tags:        Vec<String>,
}

impl PzDetail {
    pub fn new(name: impl Into<String>, description: impl Into<String>, tags: Vec<String>) -> Self {
        Self { name: name.into(), description: description.into(), tags }
    }
}

pub fn encode_detail(detail: &PzDetail) -> Vec<u8> {
    let tags = detail.tags.join(TAG_SEPARATOR);
    let mut out = Vec::with_capacity(12 + detail.name.len() + detail.description.len() + tags.len());
    for field in [detail.name.as_bytes(), detail.description.as_bytes(), tags.as_bytes()] {
        out.extend_from_slice(&(field.len() as u32).to_le_bytes());
        out.extend_from_slice(field);
    }
    out
}

fn read_field(rdr: &mut Cursor<&[u8]>, what: &str) -> Result<String> {
    let len = rdr
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::format("detail", format!("{what} length missing")))? as usize;
    let remaining = rdr.get_ref().len() - rdr.position() as usize;
    if len > remaining {
        return Err(Error::format("detail", format!(
            "{what} declares {len} bytes, {remaining} left"
        )));
    }
    let mut buf = vec![0u8; len];
    rdr.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn decode_detail(plain: &[u8]) -> Result<PzDetail> {
    let mut rdr = Cursor::new(plain);
    let name        = read_field(&mut rdr, "name")?;
    let description = read_field(&mut rdr, "description")?;
    let tags_text   = read_field(&mut rdr, "tags")?;

    let tags = if tags_text.is_empty() {
        Vec::new()
    } else {
        tags_text.split(TAG_SEPARATOR).map(str::to_owned).collect()
    };
    Ok(PzDetail { name, description, tags })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_three_length_prefixed_strings() {
        let detail = PzDetail::new("Pics", "", vec!["a".into(), "bc".into()]);
        let bytes = encode_detail(&detail);
        assert_eq!(&bytes[0..4], &4u32.to_le_bytes());
        assert_eq!(&bytes[4..8], b"Pics");
        assert_eq!(&bytes[8..12], &0u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &4u32.to_le_bytes());
        assert_eq!(&bytes[16..], b"a|bc");
        assert_eq!(decode_detail(&bytes).unwrap(), detail);
    }

    #[test]
    fn empty_tag_text_means_no_tags() {
        let detail = PzDetail::new("n", "d", vec![]);
        assert!(decode_detail(&encode_detail(&detail)).unwrap().tags.is_empty());
    }

    #[test]
    fn unicode_survives() {
        let detail = PzDetail::new("图集", "説明 ✓", vec!["タグ".into()]);
        assert_eq!(decode_detail(&encode_detail(&detail)).unwrap(), detail);
    }

    #[test]
    fn truncated_detail_is_a_format_error() {
        let mut bytes = encode_detail(&PzDetail::new("name", "desc", vec![]));
        bytes.truncate(10);
        assert!(matches!(decode_detail(&bytes), Err(Error::Format { section: "detail", .. })));
    }
}
