//! Dot-protocol framing for text and directory responses.
//!
//! Content lines are CRLF terminated, a leading `.` is stuffed by doubling it,
//! and a line holding only `.` ends the response. Most servers never send the
//! terminator and just close the connection, so EOF anywhere is a normal end
//! of stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeginLine,
    Dot,
    DotCr,
    Cr,
    Data,
    Eof,
}

/// Decodes a dot-framed stream into its content, with LF line endings.
#[derive(Debug)]
pub struct DotReader<R> {
    inner: R,
    state: State,
    terminated: bool,
}

impl<R: AsyncRead + Unpin> DotReader<BufReader<R>> {
    pub fn new(inner: R) -> Self {
        DotReader::from_buffered(BufReader::new(inner))
    }
}

impl<R: AsyncBufRead + Unpin> DotReader<R> {
    pub fn from_buffered(inner: R) -> Self {
        DotReader {
            inner,
            state: State::BeginLine,
            terminated: false,
        }
    }

    /// Whether the `.` terminator line was seen, as opposed to EOF.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Eof
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Examine the next input byte (`None` at EOF). Returns whether the byte
    /// is consumed and the byte to emit, if any.
    fn step(&mut self, b: Option<u8>) -> (bool, Option<u8>) {
        match (self.state, b) {
            (State::Eof, _) => (false, None),
            (_, None) => {
                // EOF in the middle of a line is tolerated. A lone CR or a
                // dot-CR pending at EOF is still flushed as content.
                let pending = match self.state {
                    State::Cr | State::DotCr => Some(b'\r'),
                    _ => None,
                };
                if pending.is_none() {
                    self.state = State::Eof;
                } else {
                    self.state = State::Data;
                }
                (false, pending)
            }
            (State::BeginLine, Some(b'.')) => {
                self.state = State::Dot;
                (true, None)
            }
            (State::BeginLine, Some(b'\r')) | (State::Data, Some(b'\r')) => {
                self.state = State::Cr;
                (true, None)
            }
            (State::BeginLine, Some(b'\n')) | (State::Data, Some(b'\n')) => {
                self.state = State::BeginLine;
                (true, Some(b'\n'))
            }
            (State::BeginLine, Some(c)) | (State::Data, Some(c)) => {
                self.state = State::Data;
                (true, Some(c))
            }
            (State::Dot, Some(b'\r')) => {
                self.state = State::DotCr;
                (true, None)
            }
            (State::Dot, Some(b'\n')) => {
                self.terminated = true;
                self.state = State::Eof;
                (true, None)
            }
            (State::Dot, Some(_)) => {
                // The stuffed dot is dropped; the byte is handled as data.
                self.state = State::Data;
                (false, None)
            }
            (State::DotCr, Some(b'\n')) => {
                self.terminated = true;
                self.state = State::Eof;
                (true, None)
            }
            (State::DotCr, Some(_)) => {
                // ".\rX": the CR is content, X is re-examined.
                self.state = State::Data;
                (false, Some(b'\r'))
            }
            (State::Cr, Some(b'\n')) => {
                self.state = State::BeginLine;
                (true, Some(b'\n'))
            }
            (State::Cr, Some(_)) => {
                self.state = State::Data;
                (false, Some(b'\r'))
            }
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DotReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let start = buf.filled().len();
        while buf.remaining() > 0 && this.state != State::Eof {
            let avail = if buf.filled().len() == start {
                ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?
            } else {
                // Hand back what is decoded so far rather than wait.
                match Pin::new(&mut this.inner).poll_fill_buf(cx) {
                    Poll::Ready(r) => r?,
                    Poll::Pending => return Poll::Ready(Ok(())),
                }
            };
            let byte = avail.first().copied();
            let (consume, emit) = this.step(byte);
            if consume {
                Pin::new(&mut this.inner).consume(1);
            }
            if let Some(b) = emit {
                buf.put_slice(&[b]);
            }
        }
        Poll::Ready(Ok(()))
    }
}
