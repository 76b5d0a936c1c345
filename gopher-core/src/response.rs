//! Typed response streams.
//!
//! The variant is chosen from the item type before the request is sent; see
//! [`select_variant`]. Every variant owns one [`Exchange`] and closes it once.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};

use crate::conn::Exchange;
use crate::dirent::Dirent;
use crate::dotproto::DotReader;
use crate::error::GopherError;
use crate::item_type::{ItemClass, ItemType, ItemTypeSet};
use crate::status::Status;
use crate::url::Url;
use crate::uuencode::UuDecoder;

/// How a response body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Binary,
    Text,
    Dir,
    UuEncoded,
}

/// What a caller is handed, coarsely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Binary,
    Dir,
    Text,
}

/// Choose the decoding for a request. No I/O happens here.
pub fn select_variant(item_type: ItemType, root: bool, overrides: &ItemTypeSet) -> Variant {
    if root {
        return Variant::Dir;
    }
    if item_type.is_binary() || overrides.contains(item_type) {
        Variant::Binary
    } else if item_type == ItemType::UUENCODED {
        Variant::UuEncoded
    } else if item_type.class() == ItemClass::Directory {
        Variant::Dir
    } else {
        Variant::Text
    }
}

type DotStream = DotReader<BufReader<Exchange>>;

pub enum Response {
    Binary(BinaryResponse),
    Text(TextResponse),
    Dir(DirResponse),
    UuEncoded(UuEncodedResponse),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("class", &self.class())
            .field("url", self.url())
            .finish()
    }
}

impl Response {
    pub(crate) fn new(variant: Variant, ex: Exchange) -> Response {
        match variant {
            Variant::Binary => Response::Binary(BinaryResponse::new(ex)),
            Variant::Text => Response::Text(TextResponse::new(ex)),
            Variant::Dir => Response::Dir(DirResponse::new(ex)),
            Variant::UuEncoded => Response::UuEncoded(UuEncodedResponse::new(ex)),
        }
    }

    fn exchange(&self) -> &Exchange {
        match self {
            Response::Binary(r) => &r.ex,
            Response::Text(r) => r.reader.get_ref().get_ref(),
            Response::Dir(r) => r.lines.get_ref().get_ref().get_ref(),
            Response::UuEncoded(r) => r.decoder.get_ref().get_ref().get_ref().get_ref(),
        }
    }

    pub fn url(&self) -> &Url {
        self.exchange().url()
    }

    pub fn status(&self) -> Status {
        self.exchange().status()
    }

    pub fn class(&self) -> ResponseClass {
        match self {
            Response::Binary(_) | Response::UuEncoded(_) => ResponseClass::Binary,
            Response::Text(_) => ResponseClass::Text,
            Response::Dir(_) => ResponseClass::Dir,
        }
    }

    /// The decoded byte stream, for every variant except directories.
    pub fn reader(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)> {
        match self {
            Response::Binary(r) => Some(r),
            Response::Text(r) => Some(r),
            Response::UuEncoded(r) => Some(r),
            Response::Dir(_) => None,
        }
    }

    pub fn into_dir(self) -> Option<DirResponse> {
        match self {
            Response::Dir(d) => Some(d),
            _ => None,
        }
    }

    /// Close the connection and finalize any recording. Idempotent.
    pub async fn close(&mut self) -> Result<(), GopherError> {
        match self {
            Response::Binary(r) => r.close().await,
            Response::Text(r) => r.close().await,
            Response::Dir(r) => r.close().await,
            Response::UuEncoded(r) => r.close().await,
        }
    }
}

/// Raw bytes until the server closes the connection.
pub struct BinaryResponse {
    ex: Exchange,
}

impl BinaryResponse {
    pub(crate) fn new(ex: Exchange) -> Self {
        BinaryResponse { ex }
    }

    pub fn url(&self) -> &Url {
        self.ex.url()
    }

    pub async fn close(&mut self) -> Result<(), GopherError> {
        self.ex.close().await
    }
}

impl AsyncRead for BinaryResponse {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ex).poll_read(cx, buf)
    }
}

/// Dot-protocol text, with LF line endings.
pub struct TextResponse {
    reader: DotStream,
}

impl TextResponse {
    pub(crate) fn new(ex: Exchange) -> Self {
        TextResponse {
            reader: DotReader::new(ex),
        }
    }

    pub fn url(&self) -> &Url {
        self.reader.get_ref().get_ref().url()
    }

    /// Whether the server sent the `.` terminator before closing.
    pub fn terminated(&self) -> bool {
        self.reader.terminated()
    }

    pub async fn close(&mut self) -> Result<(), GopherError> {
        self.reader.get_mut().get_mut().close().await
    }
}

impl fmt::Debug for TextResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextResponse")
            .field("url", self.url())
            .field("terminated", &self.terminated())
            .finish()
    }
}

impl AsyncRead for TextResponse {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// A directory listing, read one entry at a time.
pub struct DirResponse {
    lines: BufReader<DotStream>,
    buf: Vec<u8>,
    line: usize,
    error: Option<GopherError>,
    done: bool,
}

impl DirResponse {
    pub(crate) fn new(ex: Exchange) -> Self {
        DirResponse {
            lines: BufReader::new(DotReader::new(ex)),
            buf: Vec::new(),
            line: 0,
            error: None,
            done: false,
        }
    }

    pub fn url(&self) -> &Url {
        self.lines.get_ref().get_ref().get_ref().url()
    }

    /// The next entry, or `None` at the end of the listing or after the first
    /// failure. The failure is reported by [`DirResponse::close`].
    pub async fn next(&mut self) -> Option<Dirent> {
        while !self.done {
            self.buf.clear();
            match self.lines.read_until(b'\n', &mut self.buf).await {
                Ok(0) => {
                    self.done = true;
                }
                Ok(_) => {
                    self.line += 1;
                    let mut end = self.buf.len();
                    while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
                        end -= 1;
                    }
                    if end == 0 {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&self.buf[..end]);
                    match Dirent::parse(&text) {
                        Ok(ent) => return Some(ent),
                        Err(e) => {
                            self.error = Some(GopherError::MalformedEntry {
                                line: self.line,
                                reason: e.reason,
                            });
                            self.done = true;
                        }
                    }
                }
                Err(e) => {
                    self.error = Some(GopherError::read(e));
                    self.done = true;
                }
            }
        }
        None
    }

    /// Every remaining entry. Stops at the first failure like [`next`](Self::next).
    pub async fn collect(&mut self) -> Vec<Dirent> {
        let mut out = Vec::new();
        while let Some(ent) = self.next().await {
            out.push(ent);
        }
        out
    }

    /// The failure that ended iteration, if any.
    pub fn error(&self) -> Option<&GopherError> {
        self.error.as_ref()
    }

    /// Close the connection. Returns the iteration failure, if there was one,
    /// on every call.
    pub async fn close(&mut self) -> Result<(), GopherError> {
        self.done = true;
        let res = self.lines.get_mut().get_mut().get_mut().close().await;
        match &self.error {
            Some(e) => Err(e.clone()),
            None => res,
        }
    }
}

/// A uuencoded file, decoded.
pub struct UuEncodedResponse {
    decoder: UuDecoder<BufReader<DotStream>>,
}

impl UuEncodedResponse {
    pub(crate) fn new(ex: Exchange) -> Self {
        UuEncodedResponse {
            decoder: UuDecoder::new(BufReader::new(DotReader::new(ex))),
        }
    }

    pub fn url(&self) -> &Url {
        self.decoder.get_ref().get_ref().get_ref().get_ref().url()
    }

    pub fn file(&self) -> Option<&str> {
        self.decoder.file()
    }

    pub fn mode(&self) -> Option<u32> {
        self.decoder.mode()
    }

    pub async fn close(&mut self) -> Result<(), GopherError> {
        self.decoder
            .get_mut()
            .get_mut()
            .get_mut()
            .get_mut()
            .close()
            .await
    }
}

impl AsyncRead for UuEncodedResponse {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.decoder).poll_read(cx, buf)
    }
}
