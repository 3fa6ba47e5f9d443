//! Compression-aware reader over an inbound image stream
//!
//! The first bytes decide the format: a gzip magic switches to streaming
//! decompression, anything else passes through untouched. Multi-member gzip
//! (concatenated `.gz` files, bgzip output) decodes as one image.

use std::io::{self, Write};

use bytes::Bytes;
use dut_core::ByteStream;
use flate2::write::MultiGzDecoder;
use futures::StreamExt;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

enum Mode {
    /// Not enough bytes seen yet to decide
    Sniffing(Vec<u8>),
    Raw,
    Gzip(MultiGzDecoder<Vec<u8>>),
    Finished,
}

/// Yields the decompressed image in chunks
pub struct ImageReader {
    stream: ByteStream,
    mode: Mode,
    compressed: Option<bool>,
}

impl ImageReader {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            mode: Mode::Sniffing(Vec::new()),
            compressed: None,
        }
    }

    /// Whether the source is gzip-compressed; `None` until the format is known
    pub fn is_compressed(&self) -> Option<bool> {
        self.compressed
    }

    /// Next non-empty chunk of image bytes, `None` at the end of the image
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if matches!(self.mode, Mode::Finished) {
                return Ok(None);
            }

            let input = match self.stream.next().await {
                Some(chunk) => Some(chunk?),
                None => None,
            };

            if let Some(out) = self.feed(input)? {
                if !out.is_empty() {
                    return Ok(Some(out));
                }
            }
        }
    }

    /// Push one inbound chunk (or end of stream) through the current mode
    fn feed(&mut self, input: Option<Bytes>) -> io::Result<Option<Bytes>> {
        let mode = std::mem::replace(&mut self.mode, Mode::Finished);

        let (next, out) = match (mode, input) {
            (Mode::Sniffing(mut head), Some(chunk)) => {
                head.extend_from_slice(&chunk);
                if head.len() < GZIP_MAGIC.len() {
                    (Mode::Sniffing(head), None)
                } else {
                    self.start(head)?
                }
            }
            // Stream shorter than the magic: raw, possibly empty
            (Mode::Sniffing(head), None) => {
                self.compressed = Some(false);
                (Mode::Finished, Some(Bytes::from(head)))
            }
            (Mode::Raw, Some(chunk)) => (Mode::Raw, Some(chunk)),
            (Mode::Raw, None) => (Mode::Finished, None),
            (Mode::Gzip(mut decoder), Some(chunk)) => {
                let out = decode(&mut decoder, &chunk)?;
                (Mode::Gzip(decoder), Some(out))
            }
            (Mode::Gzip(decoder), None) => {
                let out = decoder.finish()?;
                (Mode::Finished, Some(Bytes::from(out)))
            }
            (Mode::Finished, _) => (Mode::Finished, None),
        };

        self.mode = next;
        Ok(out)
    }

    fn start(&mut self, head: Vec<u8>) -> io::Result<(Mode, Option<Bytes>)> {
        if head.starts_with(&GZIP_MAGIC) {
            self.compressed = Some(true);
            let mut decoder = MultiGzDecoder::new(Vec::new());
            let out = decode(&mut decoder, &head)?;
            Ok((Mode::Gzip(decoder), Some(out)))
        } else {
            self.compressed = Some(false);
            Ok((Mode::Raw, Some(Bytes::from(head))))
        }
    }
}

/// Push compressed bytes and drain whatever has been decoded so far
fn decode(decoder: &mut MultiGzDecoder<Vec<u8>>, input: &[u8]) -> io::Result<Bytes> {
    decoder.write_all(input)?;
    decoder.flush()?;
    Ok(Bytes::from(std::mem::take(decoder.get_mut())))
}
