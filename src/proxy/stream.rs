use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// This is a workaround for the restriction `only auto traits can be used as
/// additional traits in a trait object`
pub trait ClientIo: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> ClientIo for T {}

pub type ClientStream = Box<dyn ClientIo + Send + Unpin>;

/// A bidirectional stream with a read buffer in front of it.
///
/// Request heads are accumulated and parsed out of the buffer; whatever the
/// client pipelined behind a CONNECT head stays buffered and is replayed to
/// whoever owns the stream next, so a hijacked tunnel never loses bytes.
pub struct BufferedConn<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn consume(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// Read more bytes from the inner stream into the buffer. Returns the
    /// number of bytes read; 0 means the peer closed the connection.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.stream.read_buf(&mut self.buffer).await
    }

    /// Drain exactly `len` bytes, pulling from the buffer first and the
    /// inner stream after.
    pub(crate) async fn read_exact_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        while self.buffer.len() < len {
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                ));
            }
        }
        Ok(self.buffer.split_to(len).freeze())
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> BufferedConn<S> {
    /// Erase the concrete stream type for the hijack handoff.
    pub fn into_boxed(self) -> BufferedConn<ClientStream> {
        BufferedConn {
            stream: Box::new(self.stream),
            buffer: self.buffer,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len().min(buf.remaining());
            let chunk = self.buffer.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
