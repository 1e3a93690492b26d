//! Binary encoding and decoding for USB/IP messages
//!
//! Every USB/IP structure has a fixed big-endian layout. Messages implement
//! [`Encode`] and [`Decode`] over `std::io` streams; anything whose size is
//! known up front also implements [`FixedSize`], which lets the async helpers
//! read a complete frame before decoding it.
//!
//! # Example
//! ```
//! use protocol::{Decode, ImportRequest, decode_from_slice, encode_to_vec};
//!
//! let req = ImportRequest::new("3-2.1");
//! let bytes = encode_to_vec(&req).unwrap();
//! assert_eq!(bytes.len(), 32);
//! let decoded: ImportRequest = decode_from_slice(&bytes).unwrap();
//! assert_eq!(decoded.bus_id, "3-2.1");
//! ```

use crate::error::{ProtocolError, Result};
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Serialize a value in USB/IP wire layout
pub trait Encode {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()>;
}

/// Deserialize a value from USB/IP wire layout
pub trait Decode: Sized {
    fn decode<R: Read>(reader: &mut R) -> Result<Self>;
}

/// Messages with a constant encoded length
pub trait FixedSize {
    const SIZE: usize;
}

/// Encode a message into a freshly allocated buffer
pub fn encode_to_vec<T: Encode>(message: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    message.encode(&mut buf)?;
    Ok(buf)
}

/// Decode a message from the start of `bytes`
///
/// Trailing bytes are ignored; a short buffer yields an EOF error.
pub fn decode_from_slice<T: Decode>(bytes: &[u8]) -> Result<T> {
    let mut cursor = bytes;
    T::decode(&mut cursor)
}

/// Write a zero padded string into a field of `size` bytes
///
/// The field always keeps at least one trailing NUL, so the longest value
/// accepted is `size - 1` bytes. Values containing NUL are rejected; the
/// reader would cut them short.
pub fn write_fixed_str<W: Write>(
    writer: &mut W,
    field: &'static str,
    value: &str,
    size: usize,
) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.contains(&0) {
        return Err(ProtocolError::InteriorNul { field });
    }
    if bytes.len() >= size {
        return Err(ProtocolError::StringTooLong {
            field,
            len: bytes.len(),
            max: size - 1,
        });
    }

    let mut buf = vec![0u8; size];
    buf[..bytes.len()].copy_from_slice(bytes);
    writer.write_all(&buf)?;
    Ok(())
}

/// Read a zero padded string field of `size` bytes, trimmed at the first NUL
pub fn read_fixed_str<R: Read>(reader: &mut R, field: &'static str, size: usize) -> Result<String> {
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;

    let end = buf.iter().position(|&b| b == 0).unwrap_or(size);
    buf.truncate(end);
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidString { field })
}

/// Read exactly one fixed-size message from an async stream
///
/// The whole frame is buffered before decoding so a decode error never
/// leaves the stream positioned mid-message.
#[cfg(feature = "async")]
pub async fn read_message_async<T, R>(reader: &mut R) -> Result<T>
where
    T: Decode + FixedSize,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; T::SIZE];
    reader.read_exact(&mut buf).await?;
    decode_from_slice(&buf)
}

/// Encode a message and write it to an async stream in one call
#[cfg(feature = "async")]
pub async fn write_message_async<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Encode,
    W: AsyncWrite + Unpin,
{
    let buf = encode_to_vec(message)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
