//! Frame codecs for worker channels.
//!
//! A codec turns one serde value into one self-delimiting frame on a byte stream and back.
//! Two codecs are provided:
//!
//! - [`BufferCodec`] - binary frames with a JSON header followed by raw out-of-band
//!   [`NumericBuffer`](crate::NumericBuffer) payloads. This is the default.
//! - [`JsonCodec`] - newline-delimited JSON, everything inline. Slower for numeric data but
//!   readable with standard tools.
//!
//! [`CodecKind`] picks one of them at runtime and is itself a [`Codec`].

use crate::buffer;
use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::str::FromStr;

/// Frame magic for the buffer codec.
const FRAME_MAGIC: [u8; 4] = *b"MOQ1";

/// Upper bound on a single frame header, to catch a desynchronized stream early.
const MAX_HEADER_LEN: usize = 256 * 1024 * 1024;

/// Upper bound on out-of-band buffers per frame.
const MAX_BUFFERS: usize = 1 << 20;

/// Upper bound on a single out-of-band buffer.
const MAX_BUFFER_LEN: u64 = 4 * 1024 * 1024 * 1024;

/// A frame encoding over byte streams.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Which codec this is.
    fn kind(&self) -> CodecKind;

    /// Write `value` as one frame. Does not flush.
    fn write_frame<T, W>(&self, writer: &mut W, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: Write;

    /// Read one frame. Returns `None` on a clean end of stream.
    fn read_frame<T, R>(&self, reader: &mut R) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        R: BufRead;
}

/// Newline-delimited JSON frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn write_frame<T, W>(&self, writer: &mut W, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: Write,
    {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        writer.write_all(&line)?;
        Ok(())
    }

    fn read_frame<T, R>(&self, reader: &mut R) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        R: BufRead,
    {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                return Ok(Some(serde_json::from_str(trimmed)?));
            }
        }
    }
}

/// Binary frames with out-of-band numeric buffers.
///
/// Layout (all integers little-endian):
///
/// ```text
/// "MOQ1" | header_len: u32 | buffer_count: u32 | header (JSON) | { len: u64 | bytes }*
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCodec;

impl Codec for BufferCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Buffer
    }

    fn write_frame<T, W>(&self, writer: &mut W, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: Write,
    {
        let (header, buffers) = buffer::capture(|| serde_json::to_vec(value));
        let header = header?;

        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::Codec(format!("frame header too large: {} bytes", header.len())))?;
        let buffer_count = u32::try_from(buffers.len())
            .map_err(|_| Error::Codec(format!("too many buffers: {}", buffers.len())))?;

        writer.write_all(&FRAME_MAGIC)?;
        writer.write_all(&header_len.to_le_bytes())?;
        writer.write_all(&buffer_count.to_le_bytes())?;
        writer.write_all(&header)?;
        for buf in &buffers {
            writer.write_all(&(buf.len() as u64).to_le_bytes())?;
            writer.write_all(buf)?;
        }
        Ok(())
    }

    fn read_frame<T, R>(&self, reader: &mut R) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        R: BufRead,
    {
        let mut magic = [0u8; 4];
        if !read_exact_or_eof(reader, &mut magic)? {
            return Ok(None);
        }
        if magic != FRAME_MAGIC {
            return Err(Error::Codec(format!(
                "bad frame magic {:?}; stream is not a buffer-codec channel",
                magic
            )));
        }

        let header_len = read_u32(reader)? as usize;
        let buffer_count = read_u32(reader)? as usize;
        if header_len > MAX_HEADER_LEN || buffer_count > MAX_BUFFERS {
            return Err(Error::Codec(format!(
                "implausible frame (header {} bytes, {} buffers)",
                header_len, buffer_count
            )));
        }

        let mut header = vec![0u8; header_len];
        reader.read_exact(&mut header)?;

        let mut buffers = Vec::with_capacity(buffer_count);
        for _ in 0..buffer_count {
            let mut len = [0u8; 8];
            reader.read_exact(&mut len)?;
            let len = u64::from_le_bytes(len);
            if len > MAX_BUFFER_LEN {
                return Err(Error::Codec(format!(
                    "implausible buffer length {} bytes",
                    len
                )));
            }
            let len = usize::try_from(len)
                .map_err(|_| Error::Codec("buffer length overflows usize".into()))?;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            buffers.push(bytes);
        }

        let value = buffer::provide(buffers, || serde_json::from_slice(&header))?;
        Ok(Some(value))
    }
}

/// Fill `buf` completely, or return `false` if the stream ended before the first byte.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

/// Runtime codec selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CodecKind {
    /// Newline-delimited JSON.
    Json,
    /// Binary frames with out-of-band buffers (default).
    #[default]
    Buffer,
}

impl Codec for CodecKind {
    fn kind(&self) -> CodecKind {
        *self
    }

    fn write_frame<T, W>(&self, writer: &mut W, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: Write,
    {
        match self {
            Self::Json => JsonCodec.write_frame(writer, value),
            Self::Buffer => BufferCodec.write_frame(writer, value),
        }
    }

    fn read_frame<T, R>(&self, reader: &mut R) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        R: BufRead,
    {
        match self {
            Self::Json => JsonCodec.read_frame(reader),
            Self::Buffer => BufferCodec.read_frame(reader),
        }
    }
}

impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "buffer" | "binary" => Ok(Self::Buffer),
            _ => Err(format!(
                "Unknown codec: '{}'. Valid options: buffer, json",
                s
            )),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Buffer => write!(f, "buffer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::NumericBuffer;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Scores {
        user: u64,
        items: NumericBuffer<u64>,
        scores: NumericBuffer<f64>,
    }

    fn sample() -> Scores {
        Scores {
            user: 42,
            items: (0..500u64).collect(),
            scores: (0..500).map(|i| i as f64 / 7.0).collect(),
        }
    }

    #[test]
    fn test_buffer_codec_frame_layout() {
        let mut out = Vec::new();
        BufferCodec.write_frame(&mut out, &sample()).unwrap();

        assert_eq!(&out[..4], b"MOQ1");
        let header_len = u32::from_le_bytes(out[4..8].try_into().unwrap()) as usize;
        let buffers = u32::from_le_bytes(out[8..12].try_into().unwrap());
        assert_eq!(buffers, 2);
        // Header holds placeholders only, numbers travel as raw bytes.
        assert!(header_len < 128);
        assert_eq!(out.len(), 12 + header_len + 2 * (8 + 500 * 8));
    }

    #[test]
    fn test_buffer_codec_multiple_frames_then_eof() {
        let mut out = Vec::new();
        BufferCodec.write_frame(&mut out, &sample()).unwrap();
        BufferCodec.write_frame(&mut out, &"second").unwrap();

        let mut reader = Cursor::new(out);
        let first: Scores = BufferCodec.read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(first, sample());
        let second: String = BufferCodec.read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(second, "second");
        assert!(BufferCodec.read_frame::<String, _>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_buffer_codec_truncated_frame_is_error() {
        let mut out = Vec::new();
        BufferCodec.write_frame(&mut out, &sample()).unwrap();
        out.truncate(out.len() - 10);

        let mut reader = Cursor::new(out);
        let err = BufferCodec.read_frame::<Scores, _>(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_buffer_codec_rejects_oversized_buffer_length() {
        let mut out = Vec::new();
        BufferCodec.write_frame(&mut out, &sample()).unwrap();
        let header_len = u32::from_le_bytes(out[4..8].try_into().unwrap()) as usize;
        let first_len = 12 + header_len;
        out[first_len..first_len + 8].copy_from_slice(&u64::MAX.to_le_bytes());

        let mut reader = Cursor::new(out);
        let err = BufferCodec.read_frame::<Scores, _>(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
        assert!(err.to_string().contains("buffer length"));
    }

    #[test]
    fn test_buffer_codec_rejects_foreign_stream() {
        let mut reader = Cursor::new(b"hello world\n".to_vec());
        let err = BufferCodec.read_frame::<String, _>(&mut reader).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_json_codec_inlines_buffers() {
        let mut out = Vec::new();
        JsonCodec.write_frame(&mut out, &sample()).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(!text.contains("$oob"));

        let mut reader = Cursor::new(out);
        let back: Scores = JsonCodec.read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(back, sample());
        assert!(JsonCodec.read_frame::<Scores, _>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_json_codec_skips_blank_lines() {
        let mut reader = Cursor::new(b"\n\r\n[1,2]\n".to_vec());
        let v: Vec<i32> = JsonCodec.read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(v, vec![1, 2]);
    }

    #[test]
    fn test_codec_kind_dispatch() {
        for kind in [CodecKind::Json, CodecKind::Buffer] {
            let mut out = Vec::new();
            kind.write_frame(&mut out, &sample()).unwrap();
            let back: Scores = kind.read_frame(&mut Cursor::new(out)).unwrap().unwrap();
            assert_eq!(back, sample());
            assert_eq!(kind.kind(), kind);
        }
    }

    #[test]
    fn test_codec_kind_from_str() {
        assert_eq!("json".parse::<CodecKind>().unwrap(), CodecKind::Json);
        assert_eq!("BUFFER".parse::<CodecKind>().unwrap(), CodecKind::Buffer);
        assert_eq!("binary".parse::<CodecKind>().unwrap(), CodecKind::Buffer);
        assert!("pickle".parse::<CodecKind>().is_err());
        assert_eq!(CodecKind::default().to_string(), "buffer");
    }
}
