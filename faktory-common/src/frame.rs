//! Incremental parser for the RESP-like subset of framing the server uses:
//! `+<text>\r\n` (simple string), `-<text>\r\n` (error), `$<len>\r\n<bytes>\r\n`
//! (bulk string), and `$-1\r\n` (null bulk).
//!
//! Mirrors the accumulate-then-parse shape of `mini-redis`'s `Connection`:
//! bytes read off the socket land in a `BytesMut` buffer, and `parse` is
//! retried after every read until it yields a complete frame or signals it
//! needs more data.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

/// One parsed reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+<text>`
    Simple(String),
    /// `-<text>`
    Error(String),
    /// `$<len>\r\n<bytes>`
    Bulk(String),
    /// `$-1`
    Null,
}

/// Accumulates bytes read off the connection and extracts complete frames.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Buffer for the connection to read more bytes into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempt to parse exactly one frame out of the buffered bytes.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame; the
    /// caller should read more bytes from the socket and call this again.
    /// Malformed framing is a fatal `Error::Protocol`.
    pub fn parse(&mut self) -> Result<Option<Frame>> {
        let Some(line_end) = find_crlf(&self.buffer) else {
            return Ok(None);
        };

        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.buffer[0] {
            b'+' => {
                let text = ascii_between(&self.buffer, 1, line_end)?;
                self.buffer.advance(line_end + 2);
                Ok(Some(Frame::Simple(text)))
            }
            b'-' => {
                let text = ascii_between(&self.buffer, 1, line_end)?;
                self.buffer.advance(line_end + 2);
                Ok(Some(Frame::Error(text)))
            }
            b'$' => self.parse_bulk(line_end),
            other => Err(Error::Protocol(format!(
                "unexpected frame type byte {:?}",
                other as char
            ))),
        }
    }

    fn parse_bulk(&mut self, line_end: usize) -> Result<Option<Frame>> {
        let len_str = ascii_between(&self.buffer, 1, line_end)?;
        let len: i64 = len_str
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid bulk length {:?}", len_str)))?;

        if len == -1 {
            self.buffer.advance(line_end + 2);
            return Ok(Some(Frame::Null));
        }
        if len < 0 {
            return Err(Error::Protocol(format!("negative bulk length {}", len)));
        }

        let len = len as usize;
        let header_len = line_end + 2;
        let total_len = header_len + len + 2;

        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let body = &self.buffer[header_len..header_len + len];
        let text = String::from_utf8(body.to_vec())
            .map_err(|e| Error::Protocol(format!("bulk string is not valid utf-8: {}", e)))?;

        if &self.buffer[header_len + len..total_len] != b"\r\n" {
            return Err(Error::Protocol("bulk string missing trailing CRLF".into()));
        }

        self.buffer.advance(total_len);
        Ok(Some(Frame::Bulk(text)))
    }
}

/// Returns the index of the `\r` in the first `\r\n` found in `buf`, if any.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    (0..buf.len() - 1).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}

fn ascii_between(buf: &[u8], start: usize, end: usize) -> Result<String> {
    String::from_utf8(buf[start..end].to_vec())
        .map_err(|e| Error::Protocol(format!("frame is not valid utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(codec: &mut FrameCodec, bytes: &[u8]) {
        codec.buffer_mut().extend_from_slice(bytes);
    }

    #[test]
    fn parses_simple_string() {
        let mut codec = FrameCodec::new();
        feed(&mut codec, b"+OK\r\n");
        assert_eq!(codec.parse().unwrap(), Some(Frame::Simple("OK".into())));
        assert_eq!(codec.parse().unwrap(), None);
    }

    #[test]
    fn parses_error() {
        let mut codec = FrameCodec::new();
        feed(&mut codec, b"-ERR something broke\r\n");
        assert_eq!(
            codec.parse().unwrap(),
            Some(Frame::Error("ERR something broke".into()))
        );
    }

    #[test]
    fn parses_null_bulk() {
        let mut codec = FrameCodec::new();
        feed(&mut codec, b"$-1\r\n");
        assert_eq!(codec.parse().unwrap(), Some(Frame::Null));
    }

    #[test]
    fn parses_bulk_string() {
        let mut codec = FrameCodec::new();
        feed(&mut codec, b"$5\r\nhello\r\n");
        assert_eq!(codec.parse().unwrap(), Some(Frame::Bulk("hello".into())));
    }

    #[test]
    fn retains_partial_frames_across_chunks() {
        let mut codec = FrameCodec::new();
        feed(&mut codec, b"$5\r\nhel");
        assert_eq!(codec.parse().unwrap(), None);
        feed(&mut codec, b"lo\r\n");
        assert_eq!(codec.parse().unwrap(), Some(Frame::Bulk("hello".into())));
    }

    #[test]
    fn parses_multiple_frames_sequentially() {
        let mut codec = FrameCodec::new();
        feed(&mut codec, b"+OK\r\n+OK\r\n");
        assert_eq!(codec.parse().unwrap(), Some(Frame::Simple("OK".into())));
        assert_eq!(codec.parse().unwrap(), Some(Frame::Simple("OK".into())));
        assert_eq!(codec.parse().unwrap(), None);
    }

    #[test]
    fn rejects_malformed_frame_type() {
        let mut codec = FrameCodec::new();
        feed(&mut codec, b"*1\r\n");
        assert!(codec.parse().is_err());
    }
}
