//! Read/write newline-framed lines from a byte-stream transport.
//!
//! A line on the wire is terminated by `\n`; that terminator is part of the
//! framing but not part of the *semantic* line used for policy matching,
//! which also has any trailing `\r` stripped (tolerating `\r\n` framing).

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Generous cap on line length; anything longer is treated as a fatal
/// session error rather than an unbounded read.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Reads newline-framed lines from a buffered [`AsyncBufRead`] transport.
///
/// Callers are expected to wrap their raw transport in a
/// `tokio::io::BufReader` (or similar) before constructing this.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// Wrap `inner` in a fresh `LineReader`.
    pub fn new(inner: R) -> Self {
        LineReader {
            inner,
            buf: Vec::with_capacity(256),
        }
    }

    /// Read one line, including its trailing `\n`.
    ///
    /// Returns the semantic line (framing trimmed of `\r`/`\n`). End of
    /// stream before a terminator is a read failure, not a normal EOF: a
    /// control-protocol connection should never be torn off mid-line.
    pub async fn read_line(&mut self) -> Result<String> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Err(Error::TransportIO(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "end of stream before line terminator",
            )));
        }
        if !self.buf.ends_with(b"\n") {
            return Err(Error::TransportIO(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "end of stream mid-line",
            )));
        }
        if self.buf.len() > MAX_LINE_LEN {
            return Err(Error::TransportIO(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line exceeded maximum length",
            )));
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Writes newline-framed lines to an [`AsyncWrite`] transport.
///
/// A write either succeeds in full (semantic line plus exactly one `\n`) or
/// surfaces an error; there is no partial-write state visible to callers.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::BufReader;

    fn reader_for(bytes: &[u8]) -> LineReader<BufReader<&[u8]>> {
        LineReader::new(BufReader::new(bytes))
    }

    #[tokio::test]
    async fn reads_simple_line() {
        let mut r = reader_for(b"GETINFO version\n");
        assert_eq!(r.read_line().await.unwrap(), "GETINFO version");
    }

    #[tokio::test]
    async fn trims_carriage_return() {
        let mut r = reader_for(b"250 OK\r\n");
        assert_eq!(r.read_line().await.unwrap(), "250 OK");
    }

    #[tokio::test]
    async fn empty_line_is_empty_string() {
        let mut r = reader_for(b"\n");
        assert_eq!(r.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn reads_multiple_lines_in_order() {
        let mut r = reader_for(b"first\nsecond\nthird\n");
        assert_eq!(r.read_line().await.unwrap(), "first");
        assert_eq!(r.read_line().await.unwrap(), "second");
        assert_eq!(r.read_line().await.unwrap(), "third");
    }

    #[tokio::test]
    async fn eof_before_terminator_is_an_error() {
        let mut r = reader_for(b"no newline here");
        assert!(r.read_line().await.is_err());
    }

    #[tokio::test]
    async fn eof_on_empty_stream_is_an_error() {
        let mut r = reader_for(b"");
        assert!(r.read_line().await.is_err());
    }

    #[tokio::test]
    async fn write_line_appends_exactly_one_newline() {
        let mut buf = Vec::new();
        write_line(&mut buf, "250 OK").await.unwrap();
        assert_eq!(buf, b"250 OK\n");
    }

    #[tokio::test]
    async fn line_exceeding_cap_is_an_error() {
        let long = "x".repeat(MAX_LINE_LEN + 10);
        let mut data = long.into_bytes();
        data.push(b'\n');
        let mut r = reader_for(&data);
        assert!(r.read_line().await.is_err());
    }
}
