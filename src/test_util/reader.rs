use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::document::document::Document;
use crate::network::frame_codec::{FrameCodec, DEFAULT_MAX_DOCUMENT_LEN};

/// Reads the documents a peer receives, e.g. from the other end of a `tokio::io::duplex` or
///  from a raw TCP stream.
pub struct DocumentReader<R: AsyncRead + Unpin> {
    reader: R,
    codec: FrameCodec,
}

impl <R: AsyncRead + Unpin> DocumentReader<R> {
    pub fn new(reader: R) -> DocumentReader<R> {
        DocumentReader {
            reader,
            codec: FrameCodec::new(DEFAULT_MAX_DOCUMENT_LEN),
        }
    }

    /// The next document, or `None` if the transport was closed. Panics if nothing arrives
    ///  within 5 seconds.
    pub async fn next(&mut self) -> Option<Document> {
        match timeout(Duration::from_secs(5), self.read_document()).await {
            Ok(doc) => doc,
            Err(_) => panic!("no document received within 5 seconds"),
        }
    }

    /// The next document, or `None` if nothing arrived within the timeout (or the transport was
    ///  closed).
    pub async fn next_timeout(&mut self, max_wait: Duration) -> Option<Document> {
        timeout(max_wait, self.read_document()).await
            .unwrap_or(None)
    }

    async fn read_document(&mut self) -> Option<Document> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(doc) = self.codec.next().expect("invalid frame") {
                return Some(doc);
            }

            let n = self.reader.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.codec.feed(&buf[..n]);
        }
    }
}
