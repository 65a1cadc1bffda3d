//! zlib stream codec for XEP-0138 stream compression.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::TransportError;
use crate::xml::ParseError;

const CHUNK: usize = 4096;

pub(crate) struct ZlibCodec {
    compress: Compress,
    decompress: Decompress,
}

impl ZlibCodec {
    pub(crate) fn new(level: Compression) -> Self {
        Self {
            compress: Compress::new(level, true),
            decompress: Decompress::new(true),
        }
    }

    /// Compresses `input` and sync-flushes, so the peer can inflate the
    /// whole element without waiting for more data.
    pub(crate) fn deflate(&mut self, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut consumed = 0;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(CHUNK);
            }
            let before = self.compress.total_in();
            self.compress
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| TransportError::Compression(e.to_string()))?;
            consumed += (self.compress.total_in() - before) as usize;
            if consumed >= input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }

    /// Inflates `input`, failing once the output exceeds `limit` bytes.
    pub(crate) fn inflate(&mut self, input: &[u8], limit: usize) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::with_capacity((input.len() * 4 + 64).min(limit.saturating_add(1)));
        let mut consumed = 0;
        loop {
            if out.capacity() - out.len() < 256 {
                out.reserve(CHUNK);
            }
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| TransportError::Compression(e.to_string()))?;
            consumed += (self.decompress.total_in() - before) as usize;
            if out.len() > limit {
                return Err(ParseError::TooLargeStanza(limit).into());
            }
            if status == Status::StreamEnd {
                return Ok(out);
            }
            if consumed >= input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}
