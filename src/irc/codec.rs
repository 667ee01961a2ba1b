/// Line codec: frames a TCP byte stream into text lines.
///
/// Splits on `\r\n` (per RFC 2812) and serializes outgoing lines with `\r\n`
/// termination. Decoding yields the raw line; command parsing happens later,
/// in the client's read pump.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum line length (including `\r\n`), per RFC 2812.
const MAX_LINE_LENGTH: usize = 512;

/// Codec error: oversized line, non-UTF-8 bytes, or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames text lines on `\r\n` boundaries.
#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Look for \r\n in the buffer.
        let crlf_pos = src.windows(2).position(|w| w == b"\r\n");

        match crlf_pos {
            Some(pos) => {
                // Extract the line (without \r\n), advance the buffer.
                let line_bytes = src.split_to(pos);
                src.advance(2); // skip \r\n

                let line = std::str::from_utf8(&line_bytes)
                    .map_err(|_| CodecError::InvalidUtf8)?;

                Ok(Some(line.to_owned()))
            }
            None => {
                // No complete line yet. Check if buffer is getting too large.
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
