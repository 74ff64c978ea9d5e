//! Content classification for relayed payloads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Empty,
    Jpeg,
    Png,
    Gif,
    Bmp,
    Pdf,
    Zip,
    Binary,
    Integer,
    Json,
    Xml,
    String,
}

impl DataKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Jpeg => "Image(JPEG)",
            Self::Png => "Image(PNG)",
            Self::Gif => "Image(GIF)",
            Self::Bmp => "Image(BMP)",
            Self::Pdf => "File(PDF)",
            Self::Zip => "File(ZIP/DOCX)",
            Self::Binary => "Binary",
            Self::Integer => "Integer",
            Self::Json => "JSON",
            Self::Xml => "XML",
            Self::String => "String",
        }
    }
}

const MAGIC: &[(&[u8], DataKind)] = &[
    (&[0xFF, 0xD8, 0xFF], DataKind::Jpeg),
    (&[0x89, 0x50, 0x4E, 0x47], DataKind::Png),
    (&[0x47, 0x49, 0x46, 0x38], DataKind::Gif),
    (&[0x42, 0x4D], DataKind::Bmp),
    (&[0x25, 0x50, 0x44, 0x46], DataKind::Pdf),
    (&[0x50, 0x4B, 0x03, 0x04], DataKind::Zip),
];

const BINARY_RATIO: f64 = 0.2;

pub fn sniff(data: &[u8]) -> DataKind {
    if data.is_empty() {
        return DataKind::Empty;
    }
    if let Some((_, kind)) = MAGIC.iter().find(|(magic, _)| data.starts_with(magic)) {
        return *kind;
    }

    let non_printable = data
        .iter()
        .filter(|byte| is_control(**byte) || **byte > 126)
        .count();
    if non_printable as f64 / data.len() as f64 > BINARY_RATIO {
        return DataKind::Binary;
    }

    let decoded = String::from_utf8_lossy(data);
    let text = decoded
        .trim_matches(|c| matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{0000}'))
        .trim();

    if text.parse::<i64>().is_ok() {
        return DataKind::Integer;
    }
    if looks_like_json(text) {
        return DataKind::Json;
    }
    if text.starts_with('<') && text.ends_with('>') && roxmltree::Document::parse(text).is_ok() {
        return DataKind::Xml;
    }
    if data.iter().all(|byte| !is_control(*byte)) {
        return DataKind::String;
    }
    DataKind::Binary
}

fn is_control(byte: u8) -> bool {
    byte < 32 && !matches!(byte, b'\t' | b'\n' | b'\r')
}

fn looks_like_json(text: &str) -> bool {
    let bracketed = (text.starts_with('{') && text.ends_with('}'))
        || (text.starts_with('[') && text.ends_with(']'));
    bracketed
        && serde_json::from_str::<serde_json::Value>(text)
            .map(|value| value.is_object() || value.is_array())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{sniff, DataKind};

    #[test]
    fn magic_bytes_win_over_text_heuristics() {
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), DataKind::Jpeg);
        assert_eq!(sniff(b"%PDF-1.7"), DataKind::Pdf);
        assert_eq!(sniff(b"BM hello"), DataKind::Bmp);
        assert_eq!(sniff(&[0x50, 0x4B, 0x03, 0x04, 0x14]), DataKind::Zip);
    }

    #[test]
    fn text_payloads_are_classified_in_order() {
        assert_eq!(sniff(b""), DataKind::Empty);
        assert_eq!(sniff(b" -42 \r\n"), DataKind::Integer);
        assert_eq!(sniff(br#"{"id": 1}"#), DataKind::Json);
        assert_eq!(sniff(b"[1,2]"), DataKind::Json);
        assert_eq!(sniff(b"<user><id>1</id></user>"), DataKind::Xml);
        assert_eq!(sniff(b"<not closed"), DataKind::String);
        assert_eq!(sniff(b"{broken"), DataKind::String);
        assert_eq!(sniff(b"hello world"), DataKind::String);
    }

    #[test]
    fn byte_order_mark_is_ignored_for_json() {
        let mut data = "\u{FEFF}".as_bytes().to_vec();
        data.extend_from_slice(br#"{"a":[1,2,3,4,5,6,7,8,9,10]}"#);
        assert_eq!(sniff(&data), DataKind::Json);
    }

    #[test]
    fn mostly_unprintable_bytes_are_binary() {
        assert_eq!(sniff(&[0x00, 0x01, 0x02, b'a', b'b']), DataKind::Binary);
        assert_eq!(sniff(b"abcdefghi\x01"), DataKind::Binary);
    }
}
