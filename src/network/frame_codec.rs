use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::document::bson;
use crate::document::document::Document;
use crate::util::error::{EncodeError, FrameError};

pub const LENGTH_PREFIX_LEN: usize = 4;

/// 16 MiB
pub const DEFAULT_MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

/// Splits a byte stream into documents.
///
/// Each document on the wire is preceded by its length as an i32 LE. The length counts the
///  prefix itself, which is the convention of the document encoding: an encoded document
///  starts with its own total length.
///
/// Bytes can be fed at arbitrary granularity; the sequence of documents returned by [FrameCodec::next]
///  does not depend on how the stream was chunked.
pub struct FrameCodec {
    buf: BytesMut,
    max_document_len: usize,
    violation: Option<FrameError>,
}

impl FrameCodec {
    pub fn new(max_document_len: usize) -> FrameCodec {
        FrameCodec {
            buf: BytesMut::new(),
            max_document_len,
            violation: None,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.violation.is_some() {
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// number of bytes buffered but not yet returned as part of a document
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete document, or `None` if the buffered data does not contain one
    ///  yet.
    ///
    /// A fatal error ([FrameError::is_fatal]) means the stream can not be trusted any more: the
    ///  codec discards everything buffered, and keeps returning the same error from then on.
    ///  A decoding error on the other hand affects only a single document, and the codec
    ///  continues with the next one.
    pub fn next(&mut self) -> Result<Option<Document>, FrameError> {
        if let Some(violation) = &self.violation {
            return Err(violation.clone());
        }

        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let declared_len = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if declared_len < bson::MIN_DOCUMENT_LEN as i32 {
            return Err(self.violated(FrameError::InvalidLength(declared_len)));
        }
        if declared_len as usize > self.max_document_len {
            return Err(self.violated(FrameError::LengthExceeded { length: declared_len, max: self.max_document_len }));
        }

        let declared_len = declared_len as usize;
        if self.buf.len() < declared_len {
            trace!("{} of {} bytes of the next document buffered", self.buf.len(), declared_len);
            return Ok(None);
        }

        let mut frame = self.buf.split_to(declared_len).freeze();
        match bson::try_deser(&mut frame) {
            Ok(doc) if !frame.has_remaining() => Ok(Some(doc)),
            Ok(_) => Err(FrameError::Decode(format!("{} bytes left in frame after decoding", frame.remaining()))),
            Err(e) => Err(FrameError::Decode(e.to_string())),
        }
    }

    fn violated(&mut self, e: FrameError) -> FrameError {
        self.buf.clear();
        self.violation = Some(e.clone());
        e
    }

    /// Encodes a document as a frame, i.e. including its length prefix. Documents whose encoded
    ///  size reaches `max_document_len` are rejected.
    pub fn encode(doc: &Document, max_document_len: usize) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        bson::ser(doc, &mut buf)?;

        if buf.len() >= max_document_len {
            return Err(EncodeError::TooLarge { length: buf.len(), max: max_document_len });
        }
        Ok(buf.freeze())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::document::document::Value;
    use bytes::BufMut;
    use rstest::rstest;

    fn sample_documents() -> Vec<Document> {
        vec![
            doc!{"_src" => "A"},
            doc!{"_src" => "A", "_dst" => "B", "herp" => "derp"},
            doc!{},
            doc!{"_src" => "B", "_dst" => "A", "payload" => vec![7u8; 3000], "n" => Value::Null},
            doc!{"_src" => "C", "nested" => doc!{"x" => 1.25, "y" => vec![Value::from(true)]}},
        ]
    }

    fn encoded(docs: &[Document]) -> Vec<u8> {
        let mut result = Vec::new();
        for d in docs {
            result.extend_from_slice(&FrameCodec::encode(d, DEFAULT_MAX_DOCUMENT_LEN).unwrap());
        }
        result
    }

    fn drain(codec: &mut FrameCodec, out: &mut Vec<Document>) {
        while let Some(doc) = codec.next().unwrap() {
            out.push(doc);
        }
    }

    #[rstest]
    #[case::byte_by_byte(1)]
    #[case::small_chunks(3)]
    #[case::odd_chunks(17)]
    #[case::large_chunks(1000)]
    #[case::all_at_once(usize::MAX)]
    fn test_chunking_is_irrelevant(#[case] chunk_size: usize) {
        let docs = sample_documents();
        let bytes = encoded(&docs);

        let mut codec = FrameCodec::new(DEFAULT_MAX_DOCUMENT_LEN);
        let mut received = Vec::new();
        for chunk in bytes.chunks(chunk_size.min(bytes.len())) {
            codec.feed(chunk);
            drain(&mut codec, &mut received);
        }

        assert_eq!(received, docs);
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_partial_prefix_is_not_consumed() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_DOCUMENT_LEN);
        codec.feed(&[22, 0]);
        assert_eq!(codec.next(), Ok(None));
        assert_eq!(codec.buffered_len(), 2);
    }

    #[test]
    fn test_partial_document_is_not_consumed() {
        let bytes = encoded(&[doc!{"hello" => "world"}]);
        let mut codec = FrameCodec::new(DEFAULT_MAX_DOCUMENT_LEN);
        codec.feed(&bytes[..10]);
        assert_eq!(codec.next(), Ok(None));
        assert_eq!(codec.buffered_len(), 10);

        codec.feed(&bytes[10..]);
        assert_eq!(codec.next(), Ok(Some(doc!{"hello" => "world"})));
    }

    #[test]
    fn test_length_exceeded() {
        let mut codec = FrameCodec::new(100);

        let mut bytes = Vec::new();
        bytes.put_i32_le(101);
        bytes.extend_from_slice(&[0u8; 200]);
        // a valid document after the bad prefix must never be produced
        bytes.extend_from_slice(&encoded(&[doc!{"_src" => "A"}]));
        codec.feed(&bytes);

        let expected = FrameError::LengthExceeded { length: 101, max: 100 };
        assert_eq!(codec.next(), Err(expected.clone()));
        assert!(expected.is_fatal());

        codec.feed(&encoded(&[doc!{"_src" => "A"}]));
        assert_eq!(codec.next(), Err(expected));
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_length_exceeded_before_document_is_complete() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_DOCUMENT_LEN);
        codec.feed(&(DEFAULT_MAX_DOCUMENT_LEN as i32 + 1).to_le_bytes());
        assert!(matches!(codec.next(), Err(FrameError::LengthExceeded { .. })));
    }

    #[rstest]
    #[case(0)]
    #[case(4)]
    #[case(-1)]
    #[case(i32::MIN)]
    fn test_invalid_length(#[case] length: i32) {
        let mut codec = FrameCodec::new(DEFAULT_MAX_DOCUMENT_LEN);
        codec.feed(&length.to_le_bytes());
        codec.feed(&[0u8; 20]);
        assert_eq!(codec.next(), Err(FrameError::InvalidLength(length)));
    }

    #[test]
    fn test_decode_error_keeps_framing_in_sync() {
        let mut bytes = Vec::new();
        // correctly framed, but with an unsupported element type
        bytes.put_i32_le(12);
        bytes.put_u8(0x07);
        bytes.extend_from_slice(b"x\0");
        bytes.extend_from_slice(&[1, 2, 3, 4, 0]);
        assert_eq!(bytes.len(), 12);
        bytes.extend_from_slice(&encoded(&[doc!{"_src" => "A"}]));

        let mut codec = FrameCodec::new(DEFAULT_MAX_DOCUMENT_LEN);
        codec.feed(&bytes);

        match codec.next() {
            Err(e @ FrameError::Decode(_)) => assert!(!e.is_fatal()),
            other => panic!("expected a decoding error, was {:?}", other),
        }
        assert_eq!(codec.next(), Ok(Some(doc!{"_src" => "A"})));
        assert_eq!(codec.next(), Ok(None));
    }

    #[test]
    fn test_encode_too_large() {
        let doc = doc!{"payload" => vec![0u8; 100]};
        assert!(matches!(FrameCodec::encode(&doc, 50), Err(EncodeError::TooLarge { max: 50, .. })));
        assert!(FrameCodec::encode(&doc, 1000).is_ok());
    }

    #[test]
    fn test_encode_at_limit() {
        let doc = doc!{"payload" => vec![0u8; 100]};
        let len = FrameCodec::encode(&doc, 1000).unwrap().len();

        assert!(matches!(FrameCodec::encode(&doc, len), Err(EncodeError::TooLarge { .. })));
        assert!(FrameCodec::encode(&doc, len + 1).is_ok());
    }
}
