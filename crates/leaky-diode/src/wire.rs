//! Bit-index request framing.
//!
//! Every request from the client is exactly three bytes: the requested bit
//! index as an unsigned big-endian integer. The server never sends framed
//! data back; its answer is the timing or rate of the connection itself.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of one request on the wire.
pub const INDEX_LEN: usize = 3;

/// Largest index a request can carry.
pub const MAX_INDEX: u32 = 0x00FF_FFFF;

/// Encode an index into its wire form.
///
/// Returns `None` if the index does not fit in 24 bits.
#[must_use]
pub fn encode_index(index: u32) -> Option<[u8; INDEX_LEN]> {
    if index > MAX_INDEX {
        return None;
    }
    let [_, a, b, c] = index.to_be_bytes();
    Some([a, b, c])
}

/// Decode an index from its wire form.
#[must_use]
pub fn decode_index(frame: [u8; INDEX_LEN]) -> u32 {
    u32::from_be_bytes([0, frame[0], frame[1], frame[2]])
}

/// Send one index request.
///
/// # Errors
///
/// Fails with [`io::ErrorKind::InvalidInput`] for indices above [`MAX_INDEX`]
/// and with the underlying error if the write fails.
pub async fn write_index<W>(writer: &mut W, index: u32) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_index(index).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bit index {index} does not fit in {INDEX_LEN} bytes"),
        )
    })?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one index request.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// requests. A close in the middle of a request is an
/// [`io::ErrorKind::UnexpectedEof`] error.
///
/// Not cancel safe: dropping the future mid-frame loses the bytes read so far.
pub async fn read_index<R>(reader: &mut R) -> io::Result<Option<u32>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut frame = [0u8; INDEX_LEN];
    let mut filled = 0;
    while filled < INDEX_LEN {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed after {filled} of {INDEX_LEN} request bytes"),
            ));
        }
        filled += n;
    }
    Ok(Some(decode_index(frame)))
}
