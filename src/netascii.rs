// Netascii translation for transfers negotiated in "netascii" mode.
//
// On the wire every line ends in CR LF and a CR that isn't part of a line ending is sent as CR NUL.
// Locally lines end in a bare LF. `NetasciiReader` sits between the backend and an outgoing
// transfer, `NetasciiWriter` between an incoming transfer and the backend. Both only ever see the
// translated stream from the session's side, so block boundaries fall on translated bytes.

use crate::backend::{Reader, Writer};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0x00;

/// How much raw backend data to pull in per refill.
const CHUNK_SIZE: usize = 4096;

/// Appends the netascii encoding of `raw` to `out`.
fn encode_into(raw: &[u8], out: &mut Vec<u8>) {
    for &b in raw {
        match b {
            LF => out.extend_from_slice(&[CR, LF]),
            CR => out.extend_from_slice(&[CR, NUL]),
            _ => out.push(b),
        }
    }
}

/// Wraps a backend reader so that reads yield netascii.
#[derive(Debug)]
pub struct NetasciiReader<R> {
    inner: R,
    raw: Box<[u8]>,
    encoded: Vec<u8>,
    pos: usize,
}

impl<R> NetasciiReader<R> {
    pub fn new(inner: R) -> NetasciiReader<R> {
        NetasciiReader {
            inner,
            raw: vec![0; CHUNK_SIZE].into_boxed_slice(),
            encoded: Vec::with_capacity(CHUNK_SIZE * 2),
            pos: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for NetasciiReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos == this.encoded.len() {
            let mut raw = ReadBuf::new(&mut this.raw);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            this.encoded.clear();
            this.pos = 0;
            // An empty refill is end of file, reported by leaving `buf` untouched.
            encode_into(raw.filled(), &mut this.encoded);
        }
        let n = buf.remaining().min(this.encoded.len() - this.pos);
        buf.put_slice(&this.encoded[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl<R: Reader> Reader for NetasciiReader<R> {
    /// The translated length can't be known without reading the whole file.
    fn size(&self) -> Option<u64> {
        None
    }
}

/// Wraps a backend writer so that netascii written to it lands in the backend with local line
/// endings.
///
/// A CR at the very end of one write can only be interpreted once the next byte shows up, so it is
/// held back until then (or until the transfer is finished).
#[derive(Debug)]
pub struct NetasciiWriter<W> {
    inner: W,
    decoded: Vec<u8>,
    written: usize,
    pending_cr: bool,
}

impl<W> NetasciiWriter<W> {
    pub fn new(inner: W) -> NetasciiWriter<W> {
        NetasciiWriter {
            inner,
            decoded: Vec::new(),
            written: 0,
            pending_cr: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn decode(&mut self, netascii: &[u8]) {
        for &b in netascii {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => {
                        self.decoded.push(LF);
                        continue;
                    }
                    NUL => {
                        self.decoded.push(CR);
                        continue;
                    }
                    // Not valid netascii; keep the CR and treat `b` as ordinary input.
                    _ => self.decoded.push(CR),
                }
            }
            if b == CR {
                self.pending_cr = true;
            } else {
                self.decoded.push(b);
            }
        }
    }

    /// Flushes a held-back CR as a literal CR. Only correct once no more input is coming.
    fn release_pending_cr(&mut self) {
        if self.pending_cr {
            self.pending_cr = false;
            self.decoded.push(CR);
        }
    }
}

impl<W: AsyncWrite + Unpin> NetasciiWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.decoded.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.decoded[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.decoded.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for NetasciiWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.decode(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.release_pending_cr();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<W: Writer> Writer for NetasciiWriter<W> {
    async fn finish(&mut self) -> io::Result<()> {
        self.release_pending_cr();
        self.flush().await?;
        self.inner.finish().await
    }

    async fn cancel(&mut self) -> io::Result<()> {
        self.decoded.clear();
        self.written = 0;
        self.pending_cr = false;
        self.inner.cancel().await
    }
}
