//! Order-preserving encoding for variable-length key segments.
//!
//! Segments are escaped and terminated with `0x00`:
//!
//! - `0x00` → `0x01 0x01`
//! - `0x01` → `0x01 0x02`
//! - `0xFF` → `0x01 0x03`
//! - All other bytes unchanged
//!
//! Because the terminator is the smallest byte, a shorter segment sorts
//! before any longer segment sharing its prefix, and a fully encoded segment
//! can be used as an exact-match scan prefix: `"ab"` encodes to `ab\0`,
//! which is never a prefix of the encoding of `"abc"`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::serde::DeserializeError;

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;

/// Appends the escaped, terminated form of `value` to `buf`.
pub fn serialize(value: &[u8], buf: &mut BytesMut) {
    for &b in value {
        match b {
            0x00 => buf.put_slice(&[ESCAPE, 0x01]),
            0x01 => buf.put_slice(&[ESCAPE, 0x02]),
            0xFF => buf.put_slice(&[ESCAPE, 0x03]),
            other => buf.put_u8(other),
        }
    }
    buf.put_u8(TERMINATOR);
}

/// Reads one terminated segment from the front of `buf`, advancing it past
/// the terminator.
pub fn deserialize(buf: &mut &[u8]) -> Result<Bytes, DeserializeError> {
    let mut out = BytesMut::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            TERMINATOR => {
                *buf = &buf[i + 1..];
                return Ok(out.freeze());
            }
            ESCAPE => {
                let Some(&code) = buf.get(i + 1) else {
                    return Err(DeserializeError::new("truncated escape sequence"));
                };
                let decoded = match code {
                    0x01 => 0x00,
                    0x02 => 0x01,
                    0x03 => 0xFF,
                    other => {
                        return Err(DeserializeError::new(format!(
                            "invalid escape code: 0x{:02x}",
                            other
                        )));
                    }
                };
                out.put_u8(decoded);
                i += 2;
            }
            other => {
                out.put_u8(other);
                i += 1;
            }
        }
    }
    Err(DeserializeError::new("missing segment terminator"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn encode(value: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        serialize(value, &mut buf);
        buf.freeze()
    }

    #[rstest]
    #[case::plain(b"example.com".as_slice())]
    #[case::empty(b"".as_slice())]
    #[case::escapes(b"\x00\x01\xff#".as_slice())]
    fn should_decode_what_was_encoded(#[case] value: &[u8]) {
        // given
        let encoded = encode(value);
        let mut buf = encoded.as_ref();

        // when
        let decoded = deserialize(&mut buf).unwrap();

        // then
        assert_eq!(decoded.as_ref(), value);
        assert!(buf.is_empty());
    }

    #[test]
    fn should_sort_shorter_segment_first() {
        // given
        let short = encode(b"/a");
        let long = encode(b"/a/b");

        // when/then
        assert!(short < long);
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn should_leave_remaining_segments_in_buffer() {
        // given
        let mut buf = BytesMut::new();
        serialize(b"site", &mut buf);
        serialize(b"widget", &mut buf);
        let encoded = buf.freeze();
        let mut rest = encoded.as_ref();

        // when
        let first = deserialize(&mut rest).unwrap();
        let second = deserialize(&mut rest).unwrap();

        // then
        assert_eq!(first.as_ref(), b"site");
        assert_eq!(second.as_ref(), b"widget");
        assert!(rest.is_empty());
    }

    #[rstest]
    #[case::unterminated(b"abc".as_slice(), "missing segment terminator")]
    #[case::truncated_escape(b"ab\x01".as_slice(), "truncated escape sequence")]
    #[case::bad_escape(b"ab\x01\x09\x00".as_slice(), "invalid escape code")]
    fn should_reject_malformed_segment(#[case] data: &[u8], #[case] expected: &str) {
        // given
        let mut buf = data;

        // when
        let result = deserialize(&mut buf);

        // then
        assert!(result.unwrap_err().message.contains(expected));
    }
}
