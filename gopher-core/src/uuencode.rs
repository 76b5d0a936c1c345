//! Streaming uudecoder for type `6` items.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Body,
    Done,
}

/// Decodes `begin <mode> <name>` ... `end` framed data.
///
/// Lines before the `begin` header are skipped. EOF before `end` is a normal
/// end of stream.
#[derive(Debug)]
pub struct UuDecoder<R> {
    inner: R,
    phase: Phase,
    line: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    file: Option<String>,
    mode: Option<u32>,
}

impl<R: AsyncBufRead + Unpin> UuDecoder<R> {
    pub fn new(inner: R) -> Self {
        UuDecoder {
            inner,
            phase: Phase::Header,
            line: Vec::new(),
            out: Vec::new(),
            pos: 0,
            file: None,
            mode: None,
        }
    }

    /// The embedded file name, once the header has been read.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// The embedded permission bits, once the header has been read.
    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Accumulate one line into `self.line`. Ready(false) means EOF with
    /// nothing buffered.
    fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            let avail = ready!(Pin::new(&mut self.inner).poll_fill_buf(cx))?;
            if avail.is_empty() {
                return Poll::Ready(Ok(!self.line.is_empty()));
            }
            match avail.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.line.extend_from_slice(&avail[..i]);
                    Pin::new(&mut self.inner).consume(i + 1);
                    return Poll::Ready(Ok(true));
                }
                None => {
                    let n = avail.len();
                    self.line.extend_from_slice(avail);
                    Pin::new(&mut self.inner).consume(n);
                }
            }
        }
    }

    fn handle_line(&mut self) -> io::Result<()> {
        let mut line = std::mem::take(&mut self.line);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        match self.phase {
            Phase::Header => {
                if let Some((mode, file)) = parse_header(&line) {
                    self.mode = Some(mode);
                    self.file = Some(file);
                    self.phase = Phase::Body;
                }
            }
            Phase::Body => {
                if line == b"end" || line.starts_with(b"end ") {
                    self.phase = Phase::Done;
                } else {
                    decode_line(&line, &mut self.out)?;
                }
            }
            Phase::Done => {}
        }
        Ok(())
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for UuDecoder<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.pos < this.out.len() {
                let n = buf.remaining().min(this.out.len() - this.pos);
                buf.put_slice(&this.out[this.pos..this.pos + n]);
                this.pos += n;
                if this.pos == this.out.len() {
                    this.out.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if this.phase == Phase::Done {
                return Poll::Ready(Ok(()));
            }
            if !ready!(this.poll_line(cx))? {
                this.phase = Phase::Done;
                return Poll::Ready(Ok(()));
            }
            this.handle_line()?;
        }
    }
}

fn parse_header(line: &[u8]) -> Option<(u32, String)> {
    let text = std::str::from_utf8(line).ok()?;
    let rest = text.strip_prefix("begin ")?;
    let mut parts = rest.trim_start().splitn(2, ' ');
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let file = parts.next().unwrap_or("").trim().to_string();
    Some((mode, file))
}

fn sextet(c: u8) -> u8 {
    // Backtick stands in for space (zero) in most encoders.
    c.wrapping_sub(b' ') & 0x3f
}

fn decode_line(line: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    let Some(&len_char) = line.first() else {
        return Ok(());
    };
    let len = sextet(len_char) as usize;
    if len == 0 {
        return Ok(());
    }
    let data = &line[1..];
    let needed = (len + 2) / 3 * 4;
    if data.len() < needed {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("uuencoded line too short: want {} chars, have {}", needed, data.len()),
        ));
    }
    let mut written = 0;
    for quad in data[..needed].chunks(4) {
        let (a, b, c, d) = (sextet(quad[0]), sextet(quad[1]), sextet(quad[2]), sextet(quad[3]));
        let bytes = [(a << 2) | (b >> 4), (b << 4) | (c >> 2), (c << 6) | d];
        let take = (len - written).min(3);
        out.extend_from_slice(&bytes[..take]);
        written += take;
    }
    Ok(())
}
