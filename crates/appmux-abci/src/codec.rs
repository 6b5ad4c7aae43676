use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from either side of the connection.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const MAX_VARINT_LEN: usize = 10;

/// Length-delimited ABCI framing: an unsigned varint byte count followed by
/// the protobuf-encoded message. Both supported dialects frame messages this
/// way; they differ only in message content, which the proxy never decodes.
#[derive(Debug, Clone, Copy)]
pub struct AbciCodec {
    max_frame_len: usize,
}

impl AbciCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for AbciCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for AbciCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, header_len)) = read_uvarint(&src[..])? else {
            return Ok(None);
        };
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.max_frame_len)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "abci frame of {len} bytes exceeds limit of {} bytes",
                        self.max_frame_len
                    ),
                )
            })?;

        let total = header_len + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for AbciCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "abci frame of {} bytes exceeds limit of {} bytes",
                    item.len(),
                    self.max_frame_len
                ),
            ));
        }

        let mut value = item.len() as u64;
        dst.reserve(MAX_VARINT_LEN + item.len());
        while value >= 0x80 {
            dst.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        dst.put_u8(value as u8);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Returns the decoded value and its encoded width, or `None` while the
/// varint is still incomplete.
fn read_uvarint(buf: &[u8]) -> io::Result<Option<(u64, usize)>> {
    let mut value = 0_u64;
    for index in 0..MAX_VARINT_LEN {
        let Some(&byte) = buf.get(index) else {
            return Ok(None);
        };
        if index == MAX_VARINT_LEN - 1 && byte > 1 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte < 0x80 {
            return Ok(Some((value, index + 1)));
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "abci frame length varint overflows 64 bits",
    ))
}
