//! Chunked transfer coding.
//!
//! Each chunk is `<hex-size>[;ext]CRLF<size bytes>CRLF`; a zero-size chunk
//! ends the body. The trailer section that follows the last chunk is parsed
//! by the connection like any other header block, so the decoder stops right
//! after the last chunk's size line.

use bytes::Buf;

use crate::buffer::Buffer;
use ChunkState::*;

/// Result of one decoder invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The input ran out mid-chunk; call again once more bytes arrive
    MoreDataExpected,
    /// The last chunk's size line was consumed; trailers come next
    AllDataRead,
    /// Bad size, oversized chunk or broken framing
    DataCorrupted,
    /// The owning message was discarded while decoding
    RequestCanceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Read the chunk size in hex
    Size,
    /// Whitespace after the size
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// LF ending the size line
    SizeLf,
    /// Chunk data
    Body,
    /// CR after chunk data
    BodyCr,
    /// LF after chunk data
    BodyLf,
    /// Last chunk seen
    Done,
}

/// Incremental chunked-body decoder.
///
/// All progress lives in the decoder, so a call can stop at any byte and the
/// next call resumes without re-reading consumed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDecoder {
    state: ChunkState,
    remaining: u64,
    digits: usize,
    total: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self { state: Size, remaining: 0, digits: 0, total: 0 }
    }

    /// Body bytes decoded so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Moves decoded chunk data from `src` into `body`.
    ///
    /// `limit` bounds the whole decoded body; `canceled` is the owning
    /// message's discard flag.
    pub fn decode(&mut self, src: &mut Buffer, body: &mut Buffer, limit: u64, canceled: bool) -> ChunkStatus {
        if canceled {
            return ChunkStatus::RequestCanceled;
        }

        loop {
            match self.state {
                Done => return ChunkStatus::AllDataRead,
                Body => {
                    if src.is_empty() {
                        return ChunkStatus::MoreDataExpected;
                    }
                    let n = src.move_into(body, self.remaining.min(src.len() as u64) as usize);
                    self.remaining -= n as u64;
                    if self.remaining == 0 {
                        self.state = BodyCr;
                    }
                }
                state => {
                    let bytes = src.bytes_mut();
                    if bytes.is_empty() {
                        return ChunkStatus::MoreDataExpected;
                    }
                    let byte = bytes.get_u8();
                    match self.step(state, byte, limit) {
                        Some(next) => self.state = next,
                        None => return ChunkStatus::DataCorrupted,
                    }
                }
            }
        }
    }

    fn step(&mut self, state: ChunkState, byte: u8, limit: u64) -> Option<ChunkState> {
        match (state, byte) {
            (Size, b) if b.is_ascii_hexdigit() => {
                let digit = u64::from((b as char).to_digit(16)?);
                self.remaining = self.remaining.checked_mul(16)?.checked_add(digit)?;
                self.digits += 1;
                Some(Size)
            }
            (Size, b'\t' | b' ') if self.digits > 0 => Some(SizeLws),
            (Size, b';') if self.digits > 0 => Some(Extension),
            (Size, b'\r') if self.digits > 0 => Some(SizeLf),
            (Size, b'\n') if self.digits > 0 => self.end_size_line(limit),

            (SizeLws, b'\t' | b' ') => Some(SizeLws),
            (SizeLws, b';') => Some(Extension),
            (SizeLws, b'\r') => Some(SizeLf),
            (SizeLws, b'\n') => self.end_size_line(limit),

            // extensions are ignored; a bare LF inside one is rejected
            (Extension, b'\r') => Some(SizeLf),
            (Extension, b'\n') => None,
            (Extension, _) => Some(Extension),

            (SizeLf, b'\n') => self.end_size_line(limit),

            (BodyCr, b'\r') => Some(BodyLf),
            (BodyCr, b'\n') | (BodyLf, b'\n') => Some(Size),

            _ => None,
        }
    }

    fn end_size_line(&mut self, limit: u64) -> Option<ChunkState> {
        self.digits = 0;
        if self.remaining == 0 {
            return Some(Done);
        }
        self.total = self.total.checked_add(self.remaining)?;
        if self.total > limit {
            log::debug!("chunked body of at least {} bytes exceeds limit {}", self.total, limit);
            return None;
        }
        Some(Body)
    }
}

/// Appends `data` as one chunk. Empty input writes nothing, since an empty
/// chunk would terminate the body.
pub fn encode_chunk(out: &mut Buffer, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.append_str(&format!("{:x}\r\n", data.len()));
    out.append(data);
    out.append(b"\r\n");
}

/// Appends the last chunk and the empty trailer section.
pub fn encode_last_chunk(out: &mut Buffer) {
    out.append(b"0\r\n\r\n");
}
