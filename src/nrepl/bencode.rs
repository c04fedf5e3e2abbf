//! Bencode values and an incremental frame decoder.

use bytes::{Buf, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;

/// Largest single message accepted from a client (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BencodeError {
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at offset {0}")]
    InvalidLength(usize),

    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("message larger than {0} bytes")]
    TooLarge(usize),
}

impl Bencode {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(value) => {
                out.push(b'i');
                out.extend_from_slice(value.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => encode_bytes(bytes, out),
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Byte string contents as UTF-8, if this is a valid one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bencode::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up `key` in a dictionary.
    pub fn get(&self, key: &str) -> Option<&Bencode> {
        self.as_dict()?.get(key.as_bytes())
    }

    /// String value of `key` in a dictionary.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Dictionary from string keys.
    pub fn dict<'a>(entries: impl IntoIterator<Item = (&'a str, Bencode)>) -> Self {
        Bencode::Dict(
            entries
                .into_iter()
                .map(|(key, value)| (key.as_bytes().to_vec(), value))
                .collect(),
        )
    }

    pub fn str_list<'a>(items: impl IntoIterator<Item = &'a str>) -> Self {
        Bencode::List(items.into_iter().map(Bencode::from).collect())
    }
}

impl From<&str> for Bencode {
    fn from(value: &str) -> Self {
        Bencode::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Bencode {
    fn from(value: String) -> Self {
        Bencode::Bytes(value.into_bytes())
    }
}

impl From<i64> for Bencode {
    fn from(value: i64) -> Self {
        Bencode::Int(value)
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Decode one value from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` when
/// `buf` holds only a prefix of a value.
pub fn decode(buf: &[u8]) -> Result<Option<(Bencode, usize)>, BencodeError> {
    decode_at(buf, 0, 0)
}

fn decode_at(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(Bencode, usize)>, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::TooDeep(MAX_DEPTH));
    }
    let Some(&first) = buf.get(pos) else {
        return Ok(None);
    };

    match first {
        b'i' => {
            let Some(end) = find(buf, pos + 1, b'e') else {
                return Ok(None);
            };
            let digits = &buf[pos + 1..end];
            let value = std::str::from_utf8(digits)
                .ok()
                .filter(|text| valid_integer(text))
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or(BencodeError::InvalidInteger(pos))?;
            Ok(Some((Bencode::Int(value), end + 1)))
        }
        b'0'..=b'9' => {
            let Some((bytes, next)) = decode_bytes(buf, pos)? else {
                return Ok(None);
            };
            Ok(Some((Bencode::Bytes(bytes), next)))
        }
        b'l' => {
            let mut items = Vec::new();
            let mut cursor = pos + 1;
            loop {
                match buf.get(cursor) {
                    None => return Ok(None),
                    Some(b'e') => return Ok(Some((Bencode::List(items), cursor + 1))),
                    Some(_) => match decode_at(buf, cursor, depth + 1)? {
                        Some((item, next)) => {
                            items.push(item);
                            cursor = next;
                        }
                        None => return Ok(None),
                    },
                }
            }
        }
        b'd' => {
            let mut entries = BTreeMap::new();
            let mut cursor = pos + 1;
            loop {
                match buf.get(cursor) {
                    None => return Ok(None),
                    Some(b'e') => return Ok(Some((Bencode::Dict(entries), cursor + 1))),
                    Some(b'0'..=b'9') => {
                        let Some((key, next)) = decode_bytes(buf, cursor)? else {
                            return Ok(None);
                        };
                        let Some((value, next)) = decode_at(buf, next, depth + 1)? else {
                            return Ok(None);
                        };
                        entries.insert(key, value);
                        cursor = next;
                    }
                    Some(_) => return Err(BencodeError::NonStringKey(cursor)),
                }
            }
        }
        byte => Err(BencodeError::UnexpectedByte { byte, offset: pos }),
    }
}

fn decode_bytes(buf: &[u8], pos: usize) -> Result<Option<(Vec<u8>, usize)>, BencodeError> {
    let mut cursor = pos;
    while let Some(&byte) = buf.get(cursor) {
        match byte {
            b'0'..=b'9' => cursor += 1,
            b':' => break,
            byte => return Err(BencodeError::UnexpectedByte { byte, offset: cursor }),
        }
    }
    if cursor >= buf.len() {
        return Ok(None);
    }

    let len: usize = std::str::from_utf8(&buf[pos..cursor])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(BencodeError::InvalidLength(pos))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(BencodeError::TooLarge(MAX_MESSAGE_SIZE));
    }

    let start = cursor + 1;
    let end = start + len;
    if end > buf.len() {
        return Ok(None);
    }
    Ok(Some((buf[start..end].to_vec(), end)))
}

fn find(buf: &[u8], from: usize, needle: u8) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&byte| byte == needle)
        .map(|offset| from + offset)
}

fn valid_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !(digits.len() > 1 && digits.starts_with('0'))
        && text != "-0"
}

/// Growable per-connection buffer that yields whole messages as they arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed by a complete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Remove and return the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<Bencode>, BencodeError> {
        match decode(&self.buf)? {
            Some((message, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(message))
            }
            None if self.buf.len() > MAX_MESSAGE_SIZE => {
                Err(BencodeError::TooLarge(MAX_MESSAGE_SIZE))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_message() -> Bencode {
        Bencode::dict([
            ("op", Bencode::from("eval")),
            ("code", Bencode::from("(+ 1 2)")),
            ("id", Bencode::from("7")),
        ])
    }

    #[test]
    fn encodes_dictionaries_with_sorted_keys() {
        let encoded = eval_message().encode();
        assert_eq!(encoded, b"d4:code7:(+ 1 2)2:id1:72:op4:evale".to_vec());
    }

    #[test]
    fn decodes_nested_values() {
        let (value, consumed) = decode(b"d1:ali1ei-20e3:xyze1:bdee").unwrap().unwrap();
        assert_eq!(consumed, 25);
        assert_eq!(
            value.get("a"),
            Some(&Bencode::List(vec![
                Bencode::Int(1),
                Bencode::Int(-20),
                Bencode::from("xyz")
            ]))
        );
        assert_eq!(value.get("b"), Some(&Bencode::Dict(BTreeMap::new())));
    }

    #[test]
    fn prefixes_are_incomplete_not_errors() {
        let encoded = eval_message().encode();
        for end in 0..encoded.len() {
            assert_eq!(decode(&encoded[..end]), Ok(None), "prefix of length {}", end);
        }
    }

    #[test]
    fn consumed_length_ignores_trailing_bytes() {
        let (value, consumed) = decode(b"4:spamd").unwrap().unwrap();
        assert_eq!(value, Bencode::from("spam"));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            decode(b"x"),
            Err(BencodeError::UnexpectedByte { byte: b'x', offset: 0 })
        ));
        assert_eq!(decode(b"i0x3e"), Err(BencodeError::InvalidInteger(0)));
        assert_eq!(decode(b"i03e"), Err(BencodeError::InvalidInteger(0)));
        assert_eq!(decode(b"di1e1:ae"), Err(BencodeError::NonStringKey(1)));
        assert!(matches!(decode(b"3x:abc"), Err(BencodeError::UnexpectedByte { .. })));
    }

    #[test]
    fn split_message_yields_exactly_one_frame() {
        let encoded = eval_message().encode();
        let (first, second) = encoded.split_at(encoded.len() / 2);
        let mut frames = FrameDecoder::new();

        frames.extend(first);
        assert_eq!(frames.next_message(), Ok(None));

        frames.extend(second);
        assert_eq!(frames.next_message(), Ok(Some(eval_message())));
        assert_eq!(frames.next_message(), Ok(None));
        assert_eq!(frames.buffered(), 0);
    }

    #[test]
    fn concatenated_messages_yield_two_frames_in_order() {
        let clone = Bencode::dict([("op", Bencode::from("clone"))]);
        let mut chunk = clone.encode();
        chunk.extend(eval_message().encode());

        let mut frames = FrameDecoder::new();
        frames.extend(&chunk);

        assert_eq!(frames.next_message(), Ok(Some(clone)));
        assert_eq!(frames.next_message(), Ok(Some(eval_message())));
        assert_eq!(frames.next_message(), Ok(None));
    }

    #[test]
    fn non_canonical_key_order_consumes_its_own_bytes() {
        let mut frames = FrameDecoder::new();
        frames.extend(b"d2:op5:clone2:id1:1ei42e");

        let message = frames.next_message().unwrap().unwrap();
        assert_eq!(message.get_str("op"), Some("clone"));
        assert_eq!(message.get_str("id"), Some("1"));
        assert_eq!(frames.next_message(), Ok(Some(Bencode::Int(42))));
    }
}
