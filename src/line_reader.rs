use std::io;

use bytes::{Buf, Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::parser::MAX_BULK_LEN;

/// Reads the two frame shapes the server sends: CRLF-terminated lines, and
/// length-prefixed bulk bodies (which are themselves followed by a CRLF).
///
/// Everything is handled as raw bytes. A multi-byte UTF-8 character split
/// over two TCP segments therefore stays in the buffer until the rest of the
/// frame arrives, and only complete frames are handed out for decoding.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Data that's been read in but not yet handed out.
    buf: BytesMut,
    /// Index in buf from which a CRLF pair may still appear; everything before
    /// it has already been scanned.
    maybe_crlf_from: usize,
    /// Longest line accepted before giving up on finding its CRLF.
    max_line_len: usize,
    reader: T,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }

    /// Reads one line, without its CRLF. Returns `None` at end-of-stream,
    /// dropping any partial line, and `InvalidData` once a line outgrows
    /// the length limit.
    ///
    /// Cancel-safe: the only await point is a `read_buf` into the internal
    /// buffer, so a cancelled call loses no data.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan from one byte before the newest data in case a \r arrived
            // at the end of the previous read and its \n just now.
            if let Some(eol) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let mut line =
                    self.buf.split_to(self.maybe_crlf_from + eol + 2).freeze();
                line.truncate(line.len() - 2);
                self.maybe_crlf_from = 0;

                return Ok(Some(line));
            }

            // No CRLF anywhere in buf, so it all belongs to one line.
            if self.buf.len() > self.max_line_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", self.max_line_len),
                ));
            }

            let n = self.fill().await?;
            if n == 0 {
                return Ok(None);
            }
            self.maybe_crlf_from =
                self.buf.len().checked_sub(n + 1).unwrap_or(0);
        }
    }

    /// Reads a bulk body of exactly `len` bytes plus its trailing CRLF, which
    /// is checked and dropped.
    pub async fn read_bulk(&mut self, len: usize) -> io::Result<Bytes> {
        while self.buf.len() < len + 2 {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream ended {} bytes into a {len} byte bulk reply",
                        self.buf.len()
                    ),
                ));
            }
        }

        let body = self.buf.split_to(len).freeze();
        if &self.buf[..2] != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bulk reply is not terminated by CRLF",
            ));
        }
        self.buf.advance(2);
        self.maybe_crlf_from = 0;

        Ok(body)
    }

    /// Pulls more bytes from the reader, returning how many arrived. Zero
    /// means the peer closed the stream.
    async fn fill(&mut self) -> io::Result<usize> {
        self.reader.read_buf(&mut self.buf).await
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            max_line_len: MAX_BULK_LEN,
            reader: value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    /// Writes each chunk separately, yielding in between so the reader sees
    /// them as distinct reads.
    fn feed(chunks: &'static [&'static [u8]]) -> io::DuplexStream {
        let (mut client, server) = io::duplex(4096);
        tokio::spawn(async move {
            for chunk in chunks {
                client.write_all(chunk).await.unwrap();
                yield_now().await;
            }
        });
        server
    }

    #[tokio::test]
    async fn reassembles_fragmented_lines() {
        // When properly read, each nth line should read b"+OK:{n}".
        let server = feed(&[
            b"+OK:",
            b"1\r\n",
            // Split LF
            b"+OK:",
            b"2\r",
            b"\n",
            // Split CRLF
            b"+OK:",
            b"3",
            b"\r",
            b"\n",
            // Pipelined replies
            b"+OK:4\r\n+OK:5\r\n",
            b"+OK:6\r",
            b"\n+OK:7\r\n",
        ]);

        let mut lr: LineReader<_> = server.into();
        for n in 1..=7 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("+OK:{n}")
            );
        }
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bulk_body_split_inside_a_multibyte_character() {
        // "é" is 0xC3 0xA9; the segment boundary falls between the two.
        let server = feed(&[
            b"$10\r\n{\"x\":\"",
            b"\xC3",
            b"\xA9\"}\r",
            b"\n+OK\r\n",
        ]);

        let mut lr: LineReader<_> = server.into();
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "$10");
        let body = lr.read_bulk(10).await.unwrap();
        assert_eq!(std::str::from_utf8(&body).unwrap(), "{\"x\":\"é\"}");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "+OK");
    }

    #[tokio::test]
    async fn bulk_without_crlf_is_rejected() {
        let server = feed(&[b"abcXY"]);
        let mut lr: LineReader<_> = server.into();
        let err = lr.read_bulk(3).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let server = feed(&[b"+OK\r\n+0123", b"456789", b"abcdef"]);
        let mut lr = LineReader::from(server).with_max_line_len(8);
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "+OK");
        let err = lr.read_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_bulk_is_eof() {
        let server = feed(&[b"ab"]);
        let mut lr: LineReader<_> = server.into();
        let err = lr.read_bulk(10).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
