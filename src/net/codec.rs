//! Stream framing for concatenated JSON values
//!
//! Peers write one JSON object per envelope, followed by `\n`. The decoder
//! does not rely on the newline: it accepts any sequence of self-delimiting
//! JSON values, the way a streaming JSON decoder on the other end reads them.
//!
//! Objects, arrays and strings are delimited by a byte scanner that resumes
//! where the previous call stopped, so a frame dripped in over many reads is
//! scanned once and parsed once.

use super::types::MAX_ENVELOPE_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large: {0} bytes buffered")]
    FrameTooLarge(usize),
}

/// Progress through a partially buffered object, array or string
#[derive(Debug, Default)]
struct Scan {
    /// Bytes of the buffer already examined
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Length of the first complete value in `buf`, if it has arrived
    fn find_end(&mut self, buf: &[u8]) -> Option<usize> {
        while self.pos < buf.len() {
            let b = buf[self.pos];
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// JSON value codec for `FramedRead` / `FramedWrite`
#[derive(Debug)]
pub struct JsonCodec<T> {
    max_frame: usize,
    scan: Scan,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_ENVELOPE_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            scan: Scan::default(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if self.scan.pos == 0 {
            let skip = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
            src.advance(skip);
        }
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        if matches!(first, b'{' | b'[' | b'"') {
            let Some(end) = self.scan.find_end(&src[..]) else {
                if src.len() > self.max_frame {
                    return Err(CodecError::FrameTooLarge(src.len()));
                }
                src.reserve(4096);
                return Ok(None);
            };
            self.scan = Scan::default();
            let frame = src.split_to(end);
            return Ok(Some(serde_json::from_slice(&frame)?));
        }

        // Bare numbers and literals carry no closing delimiter
        let (result, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<T>();
            let result = stream.next();
            (result, stream.byte_offset())
        };

        match result {
            Some(Ok(value)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_frame {
                    return Err(CodecError::FrameTooLarge(src.len()));
                }
                src.reserve(4096);
                Ok(None)
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
