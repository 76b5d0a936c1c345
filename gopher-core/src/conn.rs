//! Transport plumbing: dialers, the idle read timeout and the per-request
//! [`Exchange`] that tees traffic into a [`Recording`].

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tracing::trace;

use crate::error::GopherError;
use crate::recorder::Recording;
use crate::status::Status;
use crate::url::Url;

/// A bidirectional byte stream to a Gopher server.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Opens connections. Swap this out for TLS, proxies or test doubles.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// TCP wrapped in TLS. Certificate policy is entirely the caller's
/// `ClientConfig`.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsDialer {
    connector: tokio_rustls::TlsConnector,
}

#[cfg(feature = "tls")]
impl TlsDialer {
    pub fn new(config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        TlsDialer {
            connector: tokio_rustls::TlsConnector::from(config),
        }
    }
}

#[cfg(feature = "tls")]
#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>> {
        let name = tokio_rustls::rustls::ServerName::try_from(host)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        let tls = self.connector.connect(name, tcp).await?;
        Ok(Box::new(tls))
    }
}

/// Fails a read that waits longer than `timeout` for data.
///
/// The deadline is armed when a read first has to wait and cleared by every
/// read that completes, so a slow but steady stream never times out.
pub struct IdleTimeout<S> {
    inner: S,
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, timeout: Option<Duration>) -> Self {
        IdleTimeout {
            inner,
            timeout,
            sleep: None,
            armed: false,
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_read(cx, buf) {
            this.armed = false;
            return Poll::Ready(res);
        }
        let Some(timeout) = this.timeout else {
            return Poll::Pending;
        };
        let deadline = Instant::now() + timeout;
        let armed = this.armed;
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if !armed {
            sleep.as_mut().reset(deadline);
            this.armed = true;
        }
        ready!(sleep.as_mut().poll(cx));
        this.armed = false;
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no data for {:?}", timeout),
        )))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// The wire for one request.
///
/// Bytes pushed back with [`Exchange::unread`] are replayed before the
/// connection is read again. Everything written is copied to the recording's
/// request sink and everything read from the connection to its response sink.
/// The recording is finalized once, by [`Exchange::close`] or on drop.
pub struct Exchange {
    url: Url,
    conn: Option<IdleTimeout<Box<dyn Connection>>>,
    head: Vec<u8>,
    head_pos: usize,
    recording: Option<Box<dyn Recording>>,
    status: Status,
    closed: Option<Result<(), GopherError>>,
}

impl Exchange {
    pub fn new(
        url: Url,
        conn: Box<dyn Connection>,
        read_timeout: Option<Duration>,
        recording: Option<Box<dyn Recording>>,
    ) -> Self {
        Exchange {
            url,
            conn: Some(IdleTimeout::new(conn, read_timeout)),
            head: Vec::new(),
            head_pos: 0,
            recording,
            status: Status::Ok,
            closed: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status, message: &str) {
        self.status = status;
        if let Some(rec) = self.recording.as_mut() {
            rec.set_status(status, message);
        }
    }

    /// Push bytes back to the front of the read side. They are not teed a
    /// second time.
    pub fn unread(&mut self, bytes: &[u8]) {
        let mut head = bytes.to_vec();
        head.extend_from_slice(&self.head[self.head_pos..]);
        self.head = head;
        self.head_pos = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Shut the connection down and finalize the recording. Later calls
    /// return the first call's result.
    pub async fn close(&mut self) -> Result<(), GopherError> {
        if let Some(res) = &self.closed {
            return res.clone();
        }
        let mut res = Ok(());
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                if !matches!(
                    e.kind(),
                    io::ErrorKind::NotConnected
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                ) {
                    res = Err(GopherError::write(e));
                }
            }
        }
        self.head.clear();
        self.head_pos = 0;
        self.finish_recording();
        self.closed = Some(res.clone());
        res
    }

    fn finish_recording(&mut self) {
        if let Some(rec) = self.recording.take() {
            rec.done(SystemTime::now());
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.finish_recording();
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "exchange closed")
}

impl AsyncRead for Exchange {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.head_pos < this.head.len() {
            let n = buf.remaining().min(this.head.len() - this.head_pos);
            buf.put_slice(&this.head[this.head_pos..this.head_pos + n]);
            this.head_pos += n;
            if this.head_pos == this.head.len() {
                this.head.clear();
                this.head_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        let before = buf.filled().len();
        ready!(Pin::new(conn).poll_read(cx, buf))?;
        if let Some(rec) = this.recording.as_mut() {
            if let Err(e) = rec.response_sink().write_all(&buf.filled()[before..]) {
                trace!(url = %this.url, error = %e, "response recording failed");
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Exchange {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        let n = ready!(Pin::new(conn).poll_write(cx, buf))?;
        if let Some(rec) = this.recording.as_mut() {
            if let Err(e) = rec.request_sink().write_all(&buf[..n]) {
                trace!(url = %this.url, error = %e, "request recording failed");
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_flush(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
