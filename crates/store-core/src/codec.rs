//! Property-list ⇄ byte blob serializer (spec §4.3).
//!
//! The wire format is a small tagged binary encoding, chosen to be a direct,
//! dependency-free analog of the teacher's `enum_to_db`/`enum_from_db`
//! convention of keeping a typed domain value next to a canonical wire
//! representation. Both peers replicating a package must agree on this
//! format; it is documented here bit-exact (spec §6).
//!
//! Tag byte, then payload:
//!   0 Null          (no payload)
//!   1 Bool(false)    (no payload)
//!   2 Bool(true)     (no payload)
//!   3 Int            i64 little-endian
//!   4 Float          f64 little-endian
//!   5 Bytes          u32-LE length, then raw bytes
//!   6 String         u32-LE length, then UTF-8 bytes
//!   7 Array          u32-LE count, then that many encoded values
//!   8 Dict           u32-LE count, then that many (String key, value) pairs
//!                    in ascending key order (BTreeMap iteration is already
//!                    sorted, which is what makes this canonical)

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::plist::PList;

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_ARRAY: u8 = 7;
const TAG_DICT: u8 = 8;

/// Encodes a [`PList`] into its canonical binary form.
///
/// Encoding errors abort the triggering write (spec §4.3): the only failure
/// mode here is a collection exceeding `u32::MAX` elements/bytes, which is
/// surfaced rather than silently truncated.
pub fn encode(value: &PList) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

fn encode_into(value: &PList, buf: &mut Vec<u8>) -> Result<()> {
    match value {
        PList::Null => buf.push(TAG_NULL),
        PList::Bool(false) => buf.push(TAG_FALSE),
        PList::Bool(true) => buf.push(TAG_TRUE),
        PList::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        PList::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        PList::Bytes(bytes) => {
            buf.push(TAG_BYTES);
            push_length_prefixed(buf, bytes)?;
        }
        PList::String(s) => {
            buf.push(TAG_STRING);
            push_length_prefixed(buf, s.as_bytes())?;
        }
        PList::Array(items) => {
            buf.push(TAG_ARRAY);
            push_count(buf, items.len())?;
            for item in items {
                encode_into(item, buf)?;
            }
        }
        PList::Dict(map) => {
            buf.push(TAG_DICT);
            push_count(buf, map.len())?;
            for (key, value) in map {
                push_length_prefixed(buf, key.as_bytes())?;
                encode_into(value, buf)?;
            }
        }
    }
    Ok(())
}

fn push_count(buf: &mut Vec<u8>, count: usize) -> Result<()> {
    let count =
        u32::try_from(count).map_err(|_| Error::encoding("collection exceeds u32::MAX items"))?;
    buf.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

fn push_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len =
        u32::try_from(bytes.len()).map_err(|_| Error::encoding("value exceeds u32::MAX bytes"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Decodes a canonical blob back into a [`PList`].
///
/// Decode errors are the caller's responsibility to log-and-skip (spec §4.3,
/// §7) rather than fail an entire sync pass; this function itself just
/// reports what went wrong.
pub fn decode(bytes: &[u8]) -> Result<PList> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let value = decode_one(&mut cursor)?;
    if cursor.pos != cursor.bytes.len() {
        return Err(Error::encoding("trailing bytes after decoded value"));
    }
    Ok(value)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::encoding("unexpected end of blob"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().expect("slice is exactly 4 bytes");
        Ok(u32::from_le_bytes(raw))
    }

    fn take_i64(&mut self) -> Result<i64> {
        let raw: [u8; 8] = self.take(8)?.try_into().expect("slice is exactly 8 bytes");
        Ok(i64::from_le_bytes(raw))
    }

    fn take_f64(&mut self) -> Result<f64> {
        let raw: [u8; 8] = self.take(8)?.try_into().expect("slice is exactly 8 bytes");
        Ok(f64::from_le_bytes(raw))
    }

    fn take_string(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::encoding(e.to_string()))
    }
}

fn decode_one(cursor: &mut Cursor<'_>) -> Result<PList> {
    match cursor.take_u8()? {
        TAG_NULL => Ok(PList::Null),
        TAG_FALSE => Ok(PList::Bool(false)),
        TAG_TRUE => Ok(PList::Bool(true)),
        TAG_INT => Ok(PList::Int(cursor.take_i64()?)),
        TAG_FLOAT => Ok(PList::Float(cursor.take_f64()?)),
        TAG_BYTES => {
            let len = cursor.take_u32()? as usize;
            Ok(PList::Bytes(cursor.take(len)?.to_vec()))
        }
        TAG_STRING => Ok(PList::String(cursor.take_string()?)),
        TAG_ARRAY => {
            let count = cursor.take_u32()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_one(cursor)?);
            }
            Ok(PList::Array(items))
        }
        TAG_DICT => {
            let count = cursor.take_u32()?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = cursor.take_string()?;
                let value = decode_one(cursor)?;
                map.insert(key, value);
            }
            Ok(PList::Dict(map))
        }
        other => Err(Error::encoding(format!("unknown plist tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: PList) {
        let encoded = encode(&value).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrips_every_shape() {
        roundtrip(PList::Null);
        roundtrip(PList::Bool(true));
        roundtrip(PList::Bool(false));
        roundtrip(PList::Int(-42));
        roundtrip(PList::Float(3.5));
        roundtrip(PList::Bytes(vec![1, 2, 3, 255]));
        roundtrip(PList::String("hello".to_string()));
        roundtrip(PList::Array(vec![PList::Int(1), PList::String("a".into())]));

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), PList::Int(1));
        map.insert("b".to_string(), PList::Array(vec![PList::Null]));
        roundtrip(PList::Dict(map));
    }

    #[test]
    fn dict_encoding_is_key_order_independent() {
        let mut first = BTreeMap::new();
        first.insert("z".to_string(), PList::Int(1));
        first.insert("a".to_string(), PList::Int(2));

        let mut second = BTreeMap::new();
        second.insert("a".to_string(), PList::Int(2));
        second.insert("z".to_string(), PList::Int(1));

        assert_eq!(
            encode(&PList::Dict(first)).unwrap(),
            encode(&PList::Dict(second)).unwrap()
        );
    }

    #[test]
    fn decode_rejects_truncated_blob() {
        let err = decode(&[TAG_INT, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut encoded = encode(&PList::Bool(true)).unwrap();
        encoded.push(0xff);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(decode(&[0xaa]).is_err());
    }
}
