//! GPGNet wire codec.
//!
//! The game speaks a little-endian binary framing:
//!
//! ```text
//! i32 header length | header bytes | i32 chunk count | chunks...
//! chunk: u8 tag | tag 0: i32 value
//!                | tag 1: i32 length, string bytes
//! ```
//!
//! Strings are latin1 on the wire; command names and arguments are plain ASCII
//! in practice, so they are carried as bytes and surfaced as UTF-8.

use std::fmt;
use std::io::{self, Read, Write};

/// Upper bound on a command name.
pub const MAX_HEADER_LEN: usize = 4096;

/// Upper bound on a single string chunk.
pub const MAX_STRING_LEN: usize = 65536;

/// Upper bound on the number of chunks per message.
pub const MAX_CHUNKS: usize = 256;

// ============================================================================
// Message Types
// ============================================================================

/// One argument of a GPGNet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Int(i32),
    Str(String),
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Int(v) => write!(f, "{}", v),
            Chunk::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i32> for Chunk {
    fn from(v: i32) -> Self {
        Chunk::Int(v)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Str(s.to_string())
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Str(s)
    }
}

/// A command plus its argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpgNetMessage {
    pub header: String,
    pub chunks: Vec<Chunk>,
}

impl GpgNetMessage {
    pub fn new(header: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        GpgNetMessage {
            header: header.into(),
            chunks,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum CodecError {
    /// The underlying stream failed or closed.
    Io(io::Error),
    /// The frame violates a length cap or carries an unknown chunk tag.
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Io(e) => write!(f, "gpgnet io error: {}", e),
            CodecError::Malformed(m) => write!(f, "malformed gpgnet message: {}", m),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

// ============================================================================
// Encoding / Decoding
// ============================================================================

/// Write one message to `w`.
pub fn write_message<W: Write>(w: &mut W, msg: &GpgNetMessage) -> Result<(), CodecError> {
    let mut buf = Vec::with_capacity(16 + msg.header.len());
    buf.extend_from_slice(&(msg.header.len() as i32).to_le_bytes());
    buf.extend_from_slice(msg.header.as_bytes());
    buf.extend_from_slice(&(msg.chunks.len() as i32).to_le_bytes());
    for chunk in &msg.chunks {
        match chunk {
            Chunk::Int(v) => {
                buf.push(0);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Chunk::Str(s) => {
                buf.push(1);
                buf.extend_from_slice(&(s.len() as i32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Read one message from `r`, blocking until a full frame arrives.
pub fn read_message<R: Read>(r: &mut R) -> Result<GpgNetMessage, CodecError> {
    let header_len = read_i32(r)?;
    if header_len < 0 || header_len as usize > MAX_HEADER_LEN {
        return Err(CodecError::Malformed(format!(
            "header length {}",
            header_len
        )));
    }
    let header = read_string(r, header_len as usize)?;

    let chunk_count = read_i32(r)?;
    if chunk_count < 0 || chunk_count as usize > MAX_CHUNKS {
        return Err(CodecError::Malformed(format!("chunk count {}", chunk_count)));
    }

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for _ in 0..chunk_count {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        match tag[0] {
            0 => chunks.push(Chunk::Int(read_i32(r)?)),
            1 => {
                let len = read_i32(r)?;
                if len < 0 || len as usize > MAX_STRING_LEN {
                    return Err(CodecError::Malformed(format!("string length {}", len)));
                }
                chunks.push(Chunk::Str(read_string(r, len as usize)?));
            }
            other => {
                return Err(CodecError::Malformed(format!("chunk tag 0x{:02x}", other)));
            }
        }
    }

    Ok(GpgNetMessage { header, chunks })
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, CodecError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R, len: usize) -> Result<String, CodecError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    // Latin1 on the wire; map bytes 1:1 into chars.
    Ok(buf.iter().map(|&b| b as char).collect())
}

// ============================================================================
// Tests
// ============================================================================
