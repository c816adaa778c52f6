use bytes::{Buf, Bytes, BytesMut};
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, RedisResult};

/// Upper bound on buffered bytes while waiting for a CRLF. When malformed
/// input keeps the buffer growing past this, the oldest bytes are dropped
/// so only the most recent suffix is retained.
pub(crate) const MAX_LINE_BUFFER: usize = 64 * 1024;

const MAX_CLIENTS_NOTICE: &[u8] = b"-ERR max number of clients reached";

/// Frames a byte stream at CRLF boundaries.
///
/// Two delivery modes: [`read_line`](LineFramer::read_line) strips the CRLF
/// (reply headers), [`read_raw_line`](LineFramer::read_raw_line) keeps it
/// (bulk payload fragments, whose content may itself contain CR or LF).
pub(crate) struct LineFramer<R> {
    reader: R,
    buf: BytesMut,
    scan_from: usize,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    pub(crate) fn new(reader: R) -> LineFramer<R> {
        LineFramer {
            reader,
            buf: BytesMut::with_capacity(4096),
            scan_from: 0,
        }
    }

    /// Next line with its CRLF removed. A line equal to the server's
    /// max-clients notice short-circuits as a transport failure so the
    /// connection tears down instead of delivering it as a reply.
    pub(crate) async fn read_line(&mut self) -> RedisResult<Bytes> {
        let line = self.next_line(true).await?;
        if line == MAX_CLIENTS_NOTICE {
            return Err(Error::transport("max number of clients reached"));
        }
        Ok(line)
    }

    /// Next line with its CRLF preserved.
    pub(crate) async fn read_raw_line(&mut self) -> RedisResult<Bytes> {
        self.next_line(false).await
    }

    async fn next_line(&mut self, strip: bool) -> RedisResult<Bytes> {
        loop {
            if let Some(pos) = self.find_crlf() {
                let mut line = self.buf.split_to(pos + 2).freeze();
                self.scan_from = 0;
                if strip {
                    line.truncate(pos);
                }
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_BUFFER {
                let excess = self.buf.len() - MAX_LINE_BUFFER;
                self.buf.advance(excess);
                self.scan_from = self.buf.len().saturating_sub(1);
                warn!(
                    "line buffer exceeded {} bytes without a CRLF, dropped {} oldest bytes",
                    MAX_LINE_BUFFER, excess
                );
            }
            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|err| Error::transport(err.to_string()))?;
            if n == 0 {
                return Err(Error::transport("connection closed by peer"));
            }
        }
    }

    // Remembers how far it has scanned so repeated fills never rescan,
    // backing up one byte in case a CR sits at the end of the buffer.
    fn find_crlf(&mut self) -> Option<usize> {
        let end = self.buf.len().saturating_sub(1);
        for i in self.scan_from..end {
            if self.buf[i] == b'\r' && self.buf[i + 1] == b'\n' {
                return Some(i);
            }
        }
        self.scan_from = end;
        None
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::*;

    /// Reader that hands out its input in fixed-size chunks.
    struct ChunkReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl ChunkReader {
        fn new(data: Vec<u8>, chunk: usize) -> ChunkReader {
            ChunkReader { data, pos: 0, chunk }
        }
    }

    impl AsyncRead for ChunkReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos < self.data.len() {
                let want = self.chunk.min(buf.remaining());
                let end = (self.pos + want).min(self.data.len());
                let start = self.pos;
                self.pos = end;
                let chunk = self.data[start..end].to_vec();
                buf.put_slice(&chunk);
            }
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_lines_in_order() {
        let mut framer = LineFramer::new(&b"+OK\r\n:42\r\n"[..]);
        assert_eq!(framer.read_line().await.unwrap(), Bytes::from_static(b"+OK"));
        assert_eq!(framer.read_line().await.unwrap(), Bytes::from_static(b":42"));
    }

    #[tokio::test]
    async fn test_raw_line_keeps_crlf() {
        let mut framer = LineFramer::new(&b"foo\r\n"[..]);
        assert_eq!(
            framer.read_raw_line().await.unwrap(),
            Bytes::from_static(b"foo\r\n")
        );
    }

    #[tokio::test]
    async fn test_empty_line() {
        let mut framer = LineFramer::new(&b"\r\nnext\r\n"[..]);
        assert_eq!(framer.read_line().await.unwrap(), Bytes::new());
        assert_eq!(framer.read_line().await.unwrap(), Bytes::from_static(b"next"));
    }

    #[tokio::test]
    async fn test_line_split_across_chunks() {
        let reader = ChunkReader::new(b"+hello world\r\n".to_vec(), 3);
        let mut framer = LineFramer::new(reader);
        assert_eq!(
            framer.read_line().await.unwrap(),
            Bytes::from_static(b"+hello world")
        );
    }

    #[tokio::test]
    async fn test_crlf_split_across_chunks() {
        // The CR arrives at the end of one chunk, the LF in the next.
        let reader = ChunkReader::new(b"+ab\r\n+cd\r\n".to_vec(), 4);
        let mut framer = LineFramer::new(reader);
        assert_eq!(framer.read_line().await.unwrap(), Bytes::from_static(b"+ab"));
        assert_eq!(framer.read_line().await.unwrap(), Bytes::from_static(b"+cd"));
    }

    #[tokio::test]
    async fn test_closed_reader() {
        let mut framer = LineFramer::new(&b""[..]);
        match framer.read_line().await {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_clients_notice_short_circuits() {
        let mut framer = LineFramer::new(&b"-ERR max number of clients reached\r\n"[..]);
        match framer.read_line().await {
            Err(Error::Transport(msg)) => assert!(msg.contains("max number of clients")),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let mut framer = LineFramer::new(&b"-ERR unknown command\r\n"[..]);
        assert_eq!(
            framer.read_line().await.unwrap(),
            Bytes::from_static(b"-ERR unknown command")
        );
    }

    #[tokio::test]
    async fn test_overflow_keeps_most_recent_suffix() {
        let chunk = 4096;
        let mut data = vec![b'x'; MAX_LINE_BUFFER + 8 * chunk];
        data.extend_from_slice(b"\r\n");
        let total = data.len();
        let mut framer = LineFramer::new(ChunkReader::new(data, chunk));
        let line = framer.read_line().await.unwrap();
        // Oldest bytes were dropped; the buffer never exceeded the cap
        // plus one read's worth of bytes.
        assert!(line.len() < total - 2);
        assert!(line.len() <= MAX_LINE_BUFFER + chunk);
        assert!(line.iter().all(|b| *b == b'x'));
        assert!(framer.buffered() <= MAX_LINE_BUFFER + chunk);
    }
}
