//! Job frames and reply nonces.
//!
//! Three fixed layouts are in use:
//!
//! - [`FrameLayout::Icarus64`]: midstate byte-reversed at 0, header tail
//!   byte-reversed at 52, zeros between.
//! - [`FrameLayout::Compact52`]: `55 aa 0f 00`, four zero bytes, midstate at
//!   8, header tail at 40.
//! - [`FrameLayout::Scrypt160`]: `55 aa 1f 00`, target at 4, midstate at 36,
//!   the full 80-byte header at 68, `ff ff ff ff` at 148, zero fill.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::Encoder;

use super::job::{Job, HEADER_LEN};
use crate::tracing::prelude::*;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("job {field} is {got} bytes, layout needs {expected}")]
    FieldLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("frame is {got} bytes, layout needs {expected}")]
    FrameLength { expected: usize, got: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameLayout {
    Icarus64,
    Compact52,
    Scrypt160,
}

impl FrameLayout {
    pub const fn len(self) -> usize {
        match self {
            Self::Icarus64 => 64,
            Self::Compact52 => 52,
            Self::Scrypt160 => 160,
        }
    }
}

/// Byte order of the nonce at the head of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NonceOrder {
    BigEndian,
    LittleEndian,
}

impl NonceOrder {
    /// Nonce from the first four bytes of a reply.
    pub fn decode(self, reply: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = reply.get(..4)?.try_into().ok()?;
        Some(match self {
            Self::BigEndian => u32::from_be_bytes(bytes),
            Self::LittleEndian => u32::from_le_bytes(bytes),
        })
    }

    pub fn encode(self, nonce: u32) -> [u8; 4] {
        match self {
            Self::BigEndian => nonce.to_be_bytes(),
            Self::LittleEndian => nonce.to_le_bytes(),
        }
    }
}

const COMPACT_PREAMBLE: [u8; 4] = [0x55, 0xaa, 0x0f, 0x00];
const SCRYPT_PREAMBLE: [u8; 4] = [0x55, 0xaa, 0x1f, 0x00];
const SCRYPT_TRAILER: [u8; 4] = [0xff; 4];

/// Encodes [`Job`]s into the frame layout chosen at construction.
#[derive(Debug, Clone, Copy)]
pub struct JobCodec {
    layout: FrameLayout,
}

impl JobCodec {
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    /// Encode into a fresh buffer.
    pub fn frame(&mut self, job: &Job) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::with_capacity(self.layout.len());
        self.encode(job, &mut dst)?;
        Ok(dst.freeze())
    }
}

fn field<'a>(name: &'static str, bytes: &'a [u8], expected: usize) -> Result<&'a [u8], CodecError> {
    if bytes.len() != expected {
        return Err(CodecError::FieldLength {
            field: name,
            expected,
            got: bytes.len(),
        });
    }
    Ok(bytes)
}

fn put_reversed(dst: &mut BytesMut, bytes: &[u8]) {
    for b in bytes.iter().rev() {
        dst.put_u8(*b);
    }
}

impl Encoder<&Job> for JobCodec {
    type Error = CodecError;

    fn encode(&mut self, job: &Job, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let midstate = field("midstate", &job.midstate, 32)?;
        let header = field("header", &job.header, HEADER_LEN)?;
        let tail = &header[64..76];
        let start = dst.len();
        dst.reserve(self.layout.len());

        match self.layout {
            FrameLayout::Icarus64 => {
                put_reversed(dst, midstate);
                dst.put_bytes(0, 20);
                put_reversed(dst, tail);

                // Zero midstate with ntime ff ff ff ff is a command on some
                // Cairnsmore bitstreams. Never send it as a job.
                if tail[4..8] == [0xff; 4] && midstate.iter().all(|b| *b == 0) {
                    warn!(job = job.id, "Job would encode as a device command, corrupting it.");
                    dst[start + 59] = 0;
                }
            }
            FrameLayout::Compact52 => {
                dst.put_slice(&COMPACT_PREAMBLE);
                dst.put_bytes(0, 4);
                dst.put_slice(midstate);
                dst.put_slice(tail);
            }
            FrameLayout::Scrypt160 => {
                let target = field("target", &job.target, 32)?;
                dst.put_slice(&SCRYPT_PREAMBLE);
                dst.put_slice(target);
                dst.put_slice(midstate);
                dst.put_slice(header);
                dst.put_slice(&SCRYPT_TRAILER);
                dst.put_bytes(0, 8);
            }
        }

        debug_assert_eq!(dst.len() - start, self.layout.len());
        Ok(())
    }
}

/// Payload fields read back out of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFields {
    pub target: Option<Bytes>,
    pub midstate: Bytes,
    pub header_tail: Bytes,
    pub header: Option<Bytes>,
}

/// Read the payload fields of `frame` at the offsets of `layout`.
pub fn decode_frame_fields(layout: FrameLayout, frame: &[u8]) -> Result<FrameFields, CodecError> {
    if frame.len() != layout.len() {
        return Err(CodecError::FrameLength {
            expected: layout.len(),
            got: frame.len(),
        });
    }

    let reversed = |range: std::ops::Range<usize>| {
        Bytes::from(frame[range].iter().rev().copied().collect::<Vec<u8>>())
    };
    let slice = |range: std::ops::Range<usize>| Bytes::copy_from_slice(&frame[range]);

    Ok(match layout {
        FrameLayout::Icarus64 => FrameFields {
            target: None,
            midstate: reversed(0..32),
            header_tail: reversed(52..64),
            header: None,
        },
        FrameLayout::Compact52 => FrameFields {
            target: None,
            midstate: slice(8..40),
            header_tail: slice(40..52),
            header: None,
        },
        FrameLayout::Scrypt160 => FrameFields {
            target: Some(slice(4..36)),
            midstate: slice(36..68),
            header_tail: slice(68 + 64..68 + 76),
            header: Some(slice(68..148)),
        },
    })
}
