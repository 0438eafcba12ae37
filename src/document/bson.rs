//! Binary encoding of [Document]s as BSON (http://bsonspec.org):
//!
//! ```ascii
//! document: total length (i32 LE, including itself and the terminating 0) | element* | 0x00
//! element:  type tag (u8) | key (NUL terminated UTF-8) | value
//! ```
//!
//! Value types and their tags:
//!
//! ```ascii
//! 0x01 double                  f64 LE
//! 0x02 string                  i32 LE length (including the trailing NUL) | UTF-8 bytes | 0x00
//! 0x03 document                nested document
//! 0x04 array                   nested document with keys "0", "1", ...
//! 0x05 binary                  i32 LE length | subtype (u8) | bytes
//! 0x06 undefined               no payload
//! 0x07 ObjectId                12 bytes
//! 0x08 boolean                 u8 (0 or 1)
//! 0x09 UTC datetime            i64 LE millis
//! 0x0A null                    no payload
//! 0x0B regex                   pattern cstring | options cstring
//! 0x0C DBPointer               string | 12 bytes
//! 0x0D JavaScript code         string
//! 0x0E symbol                  string
//! 0x0F code with scope         i32 LE total length | string | document
//! 0x10 int32                   i32 LE
//! 0x11 timestamp               u64 LE
//! 0x12 int64                   i64 LE
//! 0x13 decimal128              16 bytes
//! 0xFF min key, 0x7F max key   no payload
//! ```
//!
//! Every value keeps its full wire representation, so decoding and re-encoding a document
//!  reproduces its bytes exactly.
//!
//! Since a document starts with its own total length, an encoded document *is* a length
//!  prefixed frame.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashSet;

use crate::document::document::{Document, Value};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::error::EncodeError;

/// length prefix plus terminating NUL of an empty document
pub const MIN_DOCUMENT_LEN: usize = 5;

const MAX_NESTING_DEPTH: usize = 100;

const TYPE_DOUBLE: u8 = 0x01;
const TYPE_STRING: u8 = 0x02;
const TYPE_DOCUMENT: u8 = 0x03;
const TYPE_ARRAY: u8 = 0x04;
const TYPE_BINARY: u8 = 0x05;
const TYPE_UNDEFINED: u8 = 0x06;
const TYPE_OBJECT_ID: u8 = 0x07;
const TYPE_BOOL: u8 = 0x08;
const TYPE_DATETIME: u8 = 0x09;
const TYPE_NULL: u8 = 0x0A;
const TYPE_REGEX: u8 = 0x0B;
const TYPE_DB_POINTER: u8 = 0x0C;
const TYPE_JAVASCRIPT: u8 = 0x0D;
const TYPE_SYMBOL: u8 = 0x0E;
const TYPE_JAVASCRIPT_WITH_SCOPE: u8 = 0x0F;
const TYPE_INT32: u8 = 0x10;
const TYPE_TIMESTAMP: u8 = 0x11;
const TYPE_INT64: u8 = 0x12;
const TYPE_DECIMAL128: u8 = 0x13;
const TYPE_MIN_KEY: u8 = 0xFF;
const TYPE_MAX_KEY: u8 = 0x7F;


pub fn ser(doc: &Document, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let start = begin_length_prefixed(buf);
    for (key, value) in doc.iter() {
        ser_element(key, value, buf)?;
    }
    buf.put_u8(0);
    end_length_prefixed(buf, start)
}

fn ser_array(values: &[Value], buf: &mut BytesMut) -> Result<(), EncodeError> {
    let start = begin_length_prefixed(buf);
    for (idx, value) in values.iter().enumerate() {
        ser_element(&idx.to_string(), value, buf)?;
    }
    buf.put_u8(0);
    end_length_prefixed(buf, start)
}

fn begin_length_prefixed(buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.put_i32_le(0); // patched in end_length_prefixed()
    start
}

fn end_length_prefixed(buf: &mut BytesMut, start: usize) -> Result<(), EncodeError> {
    let len = buf.len() - start;
    let len_i32: i32 = match len.try_into() {
        Ok(l) => l,
        Err(_) => return Err(EncodeError::TooLarge { length: len, max: i32::MAX as usize }),
    };
    buf[start..start+4].copy_from_slice(&len_i32.to_le_bytes());
    Ok(())
}

fn ser_element(key: &str, value: &Value, buf: &mut BytesMut) -> Result<(), EncodeError> {
    if key.contains('\0') {
        return Err(EncodeError::InvalidKey(key.to_string()));
    }

    buf.put_u8(type_tag(value));
    buf.put_cstring(key);

    match value {
        Value::Double(v) => buf.put_f64_le(*v),
        Value::String(s) | Value::JavaScript(s) | Value::Symbol(s) => ser_string(s, buf)?,
        Value::Document(d) => ser(d, buf)?,
        Value::Array(values) => ser_array(values, buf)?,
        Value::Binary { subtype, data } => {
            put_len(buf, data.len())?;
            buf.put_u8(*subtype);
            buf.put_slice(data);
        }
        Value::ObjectId(id) => buf.put_slice(id),
        Value::Bool(b) => buf.put_u8(if *b { 1 } else { 0 }),
        Value::DateTime(millis) => buf.put_i64_le(*millis),
        Value::Regex { pattern, options } => {
            if pattern.contains('\0') || options.contains('\0') {
                return Err(EncodeError::InvalidRegex(format!("/{}/{}", pattern, options)));
            }
            buf.put_cstring(pattern);
            buf.put_cstring(options);
        }
        Value::DbPointer { namespace, id } => {
            ser_string(namespace, buf)?;
            buf.put_slice(id);
        }
        Value::JavaScriptWithScope { code, scope } => {
            let start = begin_length_prefixed(buf);
            ser_string(code, buf)?;
            ser(scope, buf)?;
            end_length_prefixed(buf, start)?;
        }
        Value::Int32(v) => buf.put_i32_le(*v),
        Value::Timestamp(v) => buf.put_u64_le(*v),
        Value::Int64(v) => buf.put_i64_le(*v),
        Value::Decimal128(v) => buf.put_slice(v),
        Value::Undefined | Value::Null | Value::MinKey | Value::MaxKey => {}
    }
    Ok(())
}

fn ser_string(s: &str, buf: &mut BytesMut) -> Result<(), EncodeError> {
    put_len(buf, s.len() + 1)?;
    buf.put_cstring(s);
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), EncodeError> {
    match i32::try_from(len) {
        Ok(l) => {
            buf.put_i32_le(l);
            Ok(())
        }
        Err(_) => Err(EncodeError::TooLarge { length: len, max: i32::MAX as usize }),
    }
}

fn type_tag(value: &Value) -> u8 {
    match value {
        Value::Double(_) => TYPE_DOUBLE,
        Value::String(_) => TYPE_STRING,
        Value::Document(_) => TYPE_DOCUMENT,
        Value::Array(_) => TYPE_ARRAY,
        Value::Binary { .. } => TYPE_BINARY,
        Value::Undefined => TYPE_UNDEFINED,
        Value::ObjectId(_) => TYPE_OBJECT_ID,
        Value::Bool(_) => TYPE_BOOL,
        Value::DateTime(_) => TYPE_DATETIME,
        Value::Null => TYPE_NULL,
        Value::Regex { .. } => TYPE_REGEX,
        Value::DbPointer { .. } => TYPE_DB_POINTER,
        Value::JavaScript(_) => TYPE_JAVASCRIPT,
        Value::Symbol(_) => TYPE_SYMBOL,
        Value::JavaScriptWithScope { .. } => TYPE_JAVASCRIPT_WITH_SCOPE,
        Value::Int32(_) => TYPE_INT32,
        Value::Timestamp(_) => TYPE_TIMESTAMP,
        Value::Int64(_) => TYPE_INT64,
        Value::Decimal128(_) => TYPE_DECIMAL128,
        Value::MinKey => TYPE_MIN_KEY,
        Value::MaxKey => TYPE_MAX_KEY,
    }
}


/// Reads exactly one document (as determined by its length prefix) from the buffer.
pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Document> {
    deser_document(buf, 0)
}

fn deser_document(buf: &mut impl Buf, depth: usize) -> anyhow::Result<Document> {
    if depth > MAX_NESTING_DEPTH {
        bail!("documents are nested deeper than {} levels", MAX_NESTING_DEPTH);
    }

    let len = buf.try_read_i32_le()?;
    if len < MIN_DOCUMENT_LEN as i32 {
        bail!("invalid document length {}", len);
    }
    let mut body = buf.try_read_bytes(len as usize - 4)?;

    let mut result = Document::new();
    let mut keys = FxHashSet::default();
    loop {
        let tag = body.try_read_u8()?;
        if tag == 0 {
            break;
        }

        let key = body.try_read_cstring()?;
        let value = deser_value(tag, &mut body, depth)?;

        if !keys.insert(key.clone()) {
            bail!("duplicate key {:?}", key);
        }
        result.push_unchecked(key, value);
    }

    if body.has_remaining() {
        bail!("{} trailing bytes after the end of the document", body.remaining());
    }
    Ok(result)
}

fn deser_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_read_i32_le()?;
    if len < 1 {
        bail!("invalid string length {}", len);
    }
    let raw = buf.try_read_bytes(len as usize)?;
    if raw[raw.len() - 1] != 0 {
        bail!("string is not NUL terminated");
    }
    Ok(String::from_utf8(raw[..raw.len() - 1].to_vec())?)
}

fn deser_value(tag: u8, buf: &mut impl Buf, depth: usize) -> anyhow::Result<Value> {
    let value = match tag {
        TYPE_DOUBLE => Value::Double(buf.try_read_f64_le()?),
        TYPE_STRING => Value::String(deser_string(buf)?),
        TYPE_DOCUMENT => Value::Document(deser_document(buf, depth + 1)?),
        TYPE_ARRAY => {
            let as_doc = deser_document(buf, depth + 1)?;
            Value::Array(as_doc.iter().map(|(_, v)| v.clone()).collect())
        }
        TYPE_BINARY => {
            let len = buf.try_read_i32_le()?;
            if len < 0 {
                bail!("invalid binary length {}", len);
            }
            let subtype = buf.try_read_u8()?;
            let data = buf.try_read_bytes(len as usize)?.to_vec();
            Value::Binary { subtype, data }
        }
        TYPE_UNDEFINED => Value::Undefined,
        TYPE_OBJECT_ID => Value::ObjectId(buf.try_read_array()?),
        TYPE_BOOL => match buf.try_read_u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            b => bail!("invalid boolean value {}", b),
        },
        TYPE_DATETIME => Value::DateTime(buf.try_read_i64_le()?),
        TYPE_NULL => Value::Null,
        TYPE_REGEX => {
            let pattern = buf.try_read_cstring()?;
            let options = buf.try_read_cstring()?;
            Value::Regex { pattern, options }
        }
        TYPE_DB_POINTER => {
            let namespace = deser_string(buf)?;
            let id = buf.try_read_array()?;
            Value::DbPointer { namespace, id }
        }
        TYPE_JAVASCRIPT => Value::JavaScript(deser_string(buf)?),
        TYPE_SYMBOL => Value::Symbol(deser_string(buf)?),
        TYPE_JAVASCRIPT_WITH_SCOPE => {
            let len = buf.try_read_i32_le()?;
            if len < 4 {
                bail!("invalid code with scope length {}", len);
            }
            let mut content = buf.try_read_bytes(len as usize - 4)?;
            let code = deser_string(&mut content)?;
            let scope = deser_document(&mut content, depth + 1)?;
            if content.has_remaining() {
                bail!("{} trailing bytes in code with scope", content.remaining());
            }
            Value::JavaScriptWithScope { code, scope }
        }
        TYPE_INT32 => Value::Int32(buf.try_read_i32_le()?),
        TYPE_TIMESTAMP => Value::Timestamp(buf.try_read_u64_le()?),
        TYPE_INT64 => Value::Int64(buf.try_read_i64_le()?),
        TYPE_DECIMAL128 => Value::Decimal128(buf.try_read_array()?),
        TYPE_MIN_KEY => Value::MinKey,
        TYPE_MAX_KEY => Value::MaxKey,
        other => bail!("unsupported element type 0x{:02x}", other),
    };
    Ok(value)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::document::document::BINARY_SUBTYPE_UUID;

    fn encode(doc: &Document) -> BytesMut {
        let mut buf = BytesMut::new();
        ser(doc, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_empty_document() {
        let buf = encode(&Document::new());
        assert_eq!(buf.as_ref(), &[5, 0, 0, 0, 0]);
        assert_eq!(try_deser(&mut buf.freeze()).unwrap(), Document::new());
    }

    #[test]
    fn test_known_encoding() {
        // {"hello": "world"}, the example from bsonspec.org
        let buf = encode(&doc!{"hello" => "world"});
        assert_eq!(
            buf.as_ref(),
            b"\x16\x00\x00\x00\x02hello\x00\x06\x00\x00\x00world\x00\x00".as_ref(),
        );
    }

    #[test]
    fn test_all_value_types() {
        let original = doc!{
            "_src" => "A",
            "d" => 1.5,
            "i" => 42,
            "l" => 1i64 << 40,
            "b" => true,
            "n" => Value::Null,
            "bin" => vec![0u8, 1, 2, 255],
            "uuid" => Value::Binary { subtype: BINARY_SUBTYPE_UUID, data: vec![7; 16] },
            "arr" => vec![Value::from(1), Value::from("x"), Value::Array(vec![])],
            "nested" => doc!{"herp" => "derp", "deeper" => doc!{}},
            "u" => Value::Undefined,
            "oid" => Value::ObjectId([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
            "dt" => Value::DateTime(1_700_000_000_000),
            "re" => Value::Regex { pattern: "^a.*b$".to_string(), options: "i".to_string() },
            "ptr" => Value::DbPointer { namespace: "db.coll".to_string(), id: [9; 12] },
            "js" => Value::JavaScript("1 + 1".to_string()),
            "sym" => Value::Symbol("sym".to_string()),
            "jss" => Value::JavaScriptWithScope { code: "x".to_string(), scope: doc!{"x" => 1} },
            "ts" => Value::Timestamp((7u64 << 32) | 3),
            "dec" => Value::Decimal128([0x2a; 16]),
            "min" => Value::MinKey,
            "max" => Value::MaxKey,
        };

        let decoded = try_deser(&mut encode(&original).freeze()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_binary_subtype_is_kept() {
        // {"u": UUID 00 01 .. 0f}, as produced by other BSON implementations
        let mut raw = BytesMut::new();
        raw.put_i32_le(4 + 1 + 2 + 4 + 1 + 16 + 1);
        raw.put_u8(TYPE_BINARY);
        raw.put_cstring("u");
        raw.put_i32_le(16);
        raw.put_u8(BINARY_SUBTYPE_UUID);
        raw.put_slice(&(0u8..16).collect::<Vec<_>>());
        raw.put_u8(0);

        let decoded = try_deser(&mut raw.clone().freeze()).unwrap();
        assert_eq!(decoded.get("u"), Some(&Value::Binary { subtype: BINARY_SUBTYPE_UUID, data: (0u8..16).collect() }));
        assert_eq!(encode(&decoded), raw);
    }

    #[test]
    fn test_reencoding_is_byte_identical() {
        // an ObjectId, a datetime and a code with scope written by hand
        let mut raw = BytesMut::new();
        raw.put_i32_le(0);
        raw.put_u8(TYPE_OBJECT_ID);
        raw.put_cstring("_id");
        raw.put_slice(&[0x65, 0x4c, 0x0d, 0x1e, 0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07, 0x18]);
        raw.put_u8(TYPE_DATETIME);
        raw.put_cstring("at");
        raw.put_i64_le(-1);
        raw.put_u8(TYPE_JAVASCRIPT_WITH_SCOPE);
        raw.put_cstring("f");
        raw.put_i32_le(4 + 6 + 5);
        raw.put_i32_le(2);
        raw.put_cstring("x");
        raw.put_i32_le(5);
        raw.put_u8(0);
        raw.put_u8(0);
        let len = raw.len() as i32;
        raw[..4].copy_from_slice(&len.to_le_bytes());

        let decoded = try_deser(&mut raw.clone().freeze()).unwrap();
        assert_eq!(decoded.get("at"), Some(&Value::DateTime(-1)));
        assert_eq!(decoded.get("f"), Some(&Value::JavaScriptWithScope { code: "x".to_string(), scope: Document::new() }));
        assert_eq!(encode(&decoded), raw);
    }

    #[test]
    fn test_deser_consumes_exactly_one_document() {
        let mut buf = encode(&doc!{"a" => 1});
        buf.extend_from_slice(&[9, 9, 9]);

        let mut b = buf.freeze();
        assert_eq!(try_deser(&mut b).unwrap(), doc!{"a" => 1});
        assert_eq!(b.as_ref(), &[9, 9, 9]);
    }

    #[test]
    fn test_invalid_key() {
        let mut buf = BytesMut::new();
        assert_eq!(ser(&doc!{"a\0b" => 1}, &mut buf), Err(EncodeError::InvalidKey("a\0b".to_string())));
    }

    #[test]
    fn test_invalid_regex() {
        let mut buf = BytesMut::new();
        let doc = doc!{"re" => Value::Regex { pattern: "a\0".to_string(), options: String::new() }};
        assert!(matches!(ser(&doc, &mut buf), Err(EncodeError::InvalidRegex(_))));
    }

    #[test]
    fn test_truncated() {
        let buf = encode(&doc!{"hello" => "world"});
        let mut truncated = &buf[..buf.len() - 1];
        assert!(try_deser(&mut truncated).is_err());
    }

    #[test]
    fn test_inconsistent_inner_length() {
        // the outer length matches, but the string claims to be longer than the document
        let mut buf = encode(&doc!{"s" => "abc"});
        buf[7] = 100;
        assert!(try_deser(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_unknown_type() {
        let mut buf = encode(&doc!{"x" => 1});
        buf[4] = 0x20;
        assert!(try_deser(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_duplicate_key() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(19);
        for _ in 0..2 {
            buf.put_u8(TYPE_INT32);
            buf.put_cstring("a");
            buf.put_i32_le(1);
        }
        buf.put_u8(0);
        assert_eq!(buf.len(), 19);
        assert!(try_deser(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let mut d = doc!{"leaf" => 1};
        for _ in 0..=MAX_NESTING_DEPTH {
            d = doc!{"inner" => d};
        }
        assert!(try_deser(&mut encode(&d).freeze()).is_err());
    }
}
