//! The Gopher server: an accept loop that frames requests and hands the raw
//! connection to a [`Handler`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::conn::{Connection, IdleTimeout};
use crate::error::GopherError;
use crate::item_type::ItemType;
use crate::registry::Registry;
use crate::request::Request;
use crate::url::{Url, DEFAULT_PORT};

pub const DEFAULT_REQUEST_SIZE_LIMIT: usize = 4096;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_SELECTOR_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Where handlers write their response. The server adds no framing.
pub type ResponseSink = dyn AsyncWrite + Send + Unpin;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve_gopher(&self, w: &mut ResponseSink, req: Request);
}

/// Serves metadata selectors (those starting with `!` or `&`).
#[async_trait]
pub trait MetaHandler: Send + Sync + 'static {
    async fn serve_gopher_meta(&self, w: &mut ResponseSink, req: Request);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Longest accepted request line, newline included.
    pub request_size_limit: usize,
    /// Idle limit while reading a request body.
    pub read_timeout: Duration,
    /// Limit for receiving the request line.
    pub read_selector_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            request_size_limit: DEFAULT_REQUEST_SIZE_LIMIT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            read_selector_timeout: DEFAULT_READ_SELECTOR_TIMEOUT,
        }
    }
}

/// What a server says about itself through its metadata handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub software: String,
    pub version: String,
    pub architecture: String,
    pub description: String,
    pub geolocation: String,
    pub admin_email: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            description: String::new(),
            geolocation: String::new(),
            admin_email: String::new(),
        }
    }
}

pub struct Server {
    handler: Arc<dyn Handler>,
    meta: Option<Arc<dyn MetaHandler>>,
    config: ServerConfig,
    info: ServerInfo,
    live: Registry,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
}

impl Server {
    pub fn new(handler: impl Handler) -> Self {
        Server {
            handler: Arc::new(handler),
            meta: None,
            config: ServerConfig::default(),
            info: ServerInfo::default(),
            live: Registry::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Route `!` and `&` selectors to `meta`. Without one they reach the
    /// primary handler like any other selector.
    pub fn with_meta_handler(mut self, meta: impl MetaHandler) -> Self {
        self.meta = Some(Arc::new(meta));
        self
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    /// Wrap every accepted connection in TLS.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Number of listeners and connections currently tracked.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Bind `addr` and serve on it. See [`Server::serve`].
    pub async fn listen_and_serve(
        self: &Arc<Self>,
        addr: &str,
        host: Option<&str>,
    ) -> Result<(), GopherError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GopherError::Listener(Arc::new(e)))?;
        self.serve(listener, host).await
    }

    /// Accept connections until the listener fails or [`Server::close`] is
    /// called, in which case this returns [`GopherError::ServerClosed`].
    ///
    /// `host` (`name` or `name:port`) is what request URLs are built from;
    /// without it each connection's local address is used.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        host: Option<&str>,
    ) -> Result<(), GopherError> {
        let fixed = host.map(split_host_port);
        let reg = self.live.register();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening");
        }
        let res = self.accept_loop(&listener, fixed, reg.token()).await;
        drop(reg);
        info!("listener stopped");
        res
    }

    /// Stop every listener and force-close every open connection.
    pub fn close(&self) {
        self.live.close_all();
    }

    async fn accept_loop(
        self: &Arc<Self>,
        listener: &TcpListener,
        fixed: Option<(String, u16)>,
        token: &CancellationToken,
    ) -> Result<(), GopherError> {
        let mut delay = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return Err(GopherError::ServerClosed),
                res = listener.accept() => res,
            };
            let (stream, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) if is_transient(&e) => {
                    delay = if delay.is_zero() {
                        MIN_ACCEPT_DELAY
                    } else {
                        (delay * 2).min(MAX_ACCEPT_DELAY)
                    };
                    warn!(error = %e, ?delay, "accept failed; retrying");
                    tokio::select! {
                        _ = token.cancelled() => return Err(GopherError::ServerClosed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(e) => return Err(GopherError::Listener(Arc::new(e))),
            };
            delay = Duration::ZERO;

            let (host, port) = match &fixed {
                Some(hp) => hp.clone(),
                None => match stream.local_addr() {
                    Ok(addr) => (addr.ip().to_string(), addr.port()),
                    Err(e) => {
                        warn!(error = %e, "no local address for connection");
                        continue;
                    }
                },
            };

            let span = info_span!("conn", id = %Uuid::new_v4(), %remote);
            let server = Arc::clone(self);
            tokio::spawn(
                async move { server.serve_conn(stream, remote, host, port).await }.instrument(span),
            );
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, host: String, port: u16) {
        let reg = self.live.register();
        match self.wrap(stream).await {
            Ok(conn) => self.handle(conn, remote, host, port, reg.token()).await,
            Err(e) => warn!(error = %e, "connection setup failed"),
        }
    }

    #[cfg(feature = "tls")]
    async fn wrap(&self, stream: TcpStream) -> io::Result<Box<dyn Connection>> {
        match &self.tls {
            Some(acceptor) => {
                let tls = tokio::time::timeout(
                    self.config.read_selector_timeout,
                    acceptor.accept(stream),
                )
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap(&self, stream: TcpStream) -> io::Result<Box<dyn Connection>> {
        Ok(Box::new(stream))
    }

    async fn handle(
        &self,
        conn: Box<dyn Connection>,
        remote: SocketAddr,
        host: String,
        port: u16,
        token: &CancellationToken,
    ) {
        let (mut rd, mut wr) = tokio::io::split(conn);

        let read = tokio::time::timeout(
            self.config.read_selector_timeout,
            read_request_line(&mut rd, self.config.request_size_limit),
        );
        let (line, leftover) = tokio::select! {
            _ = token.cancelled() => return,
            res = read => match res {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    warn!(error = %e, "rejected request");
                    return;
                }
                Err(_) => {
                    warn!(timeout = ?self.config.read_selector_timeout, "request line timed out");
                    return;
                }
            },
        };

        let parsed = match parse_request_line(&line) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "rejected request");
                return;
            }
        };
        debug!(selector = %parsed.selector, has_body = parsed.has_body, "request");

        let url = Url {
            hostname: host,
            port,
            root: parsed.selector.is_empty(),
            item_type: ItemType::default(),
            selector: parsed.selector,
            search: parsed.search,
            plus: String::new(),
        };
        let is_meta = url.is_meta();
        let mut req = Request::new(url).with_view(parsed.view);
        req.remote_addr = Some(remote);
        if parsed.has_body {
            let body = Cursor::new(leftover).chain(rd);
            req = req.with_body(IdleTimeout::new(body, Some(self.config.read_timeout)));
        }

        let target = match (&self.meta, is_meta) {
            (Some(meta), true) => Target::Meta(Arc::clone(meta)),
            _ => Target::Primary(Arc::clone(&self.handler)),
        };
        let mut task = tokio::spawn(
            async move {
                match target {
                    Target::Meta(m) => m.serve_gopher_meta(&mut wr, req).await,
                    Target::Primary(h) => h.serve_gopher(&mut wr, req).await,
                }
                if let Err(e) = wr.flush().await {
                    debug!(error = %e, "flush failed");
                }
                if let Err(e) = wr.shutdown().await {
                    debug!(error = %e, "shutdown failed");
                }
            }
            .in_current_span(),
        );

        tokio::select! {
            res = &mut task => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!(panic = %panic_message(e), "handler panicked");
                    }
                }
            }
            _ = token.cancelled() => {
                task.abort();
                debug!("connection closed by shutdown");
            }
        }
    }
}

enum Target {
    Primary(Arc<dyn Handler>),
    Meta(Arc<dyn MetaHandler>),
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub selector: String,
    pub search: String,
    pub view: String,
    pub has_body: bool,
}

/// Read up to and including the first `\n`. Returns the line without its
/// line ending, and whatever was read past it.
pub async fn read_request_line<R: AsyncRead + Unpin>(
    rd: &mut R,
    limit: usize,
) -> Result<(Vec<u8>, Vec<u8>), GopherError> {
    let mut buf = vec![0u8; limit];
    let mut len = 0;
    loop {
        if len == limit {
            return Err(GopherError::BadRequest(format!(
                "request line longer than {} bytes",
                limit
            )));
        }
        let n = rd.read(&mut buf[len..]).await.map_err(GopherError::read)?;
        if n == 0 {
            return Err(GopherError::BadRequest(
                "connection closed before end of request line".to_string(),
            ));
        }
        let start = len;
        len += n;
        if let Some(i) = buf[start..len].iter().position(|&b| b == b'\n') {
            let nl = start + i;
            let leftover = buf[nl + 1..len].to_vec();
            buf.truncate(nl);
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok((buf, leftover));
        }
    }
}

/// `selector[\tsearch[\tview{0|1}]]`. A fourth field is rejected.
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine, GopherError> {
    let text = String::from_utf8_lossy(line);
    let mut fields = text.split('\t');
    let selector = fields.next().unwrap_or("").to_string();
    let search = fields.next().unwrap_or("").to_string();
    let (view, has_body) = match fields.next() {
        None => (String::new(), false),
        Some(field) => {
            if let Some(view) = field.strip_suffix('0') {
                (view.to_string(), false)
            } else if let Some(view) = field.strip_suffix('1') {
                (view.to_string(), true)
            } else {
                return Err(GopherError::BadRequest(format!(
                    "invalid data flag in {:?}",
                    field
                )));
            }
        }
    };
    if fields.next().is_some() {
        return Err(GopherError::BadRequest("too many fields".to_string()));
    }
    Ok(RequestLine {
        selector,
        search,
        view,
        has_body,
    })
}

/// `name:port`, `[v6]:port` or a bare name, which gets the default port.
fn split_host_port(host: &str) -> (String, u16) {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if let Some((name, port)) = host.rsplit_once(':') {
        if !name.contains(':') {
            if let Ok(port) = port.parse() {
                return (name.to_string(), port);
            }
        }
    }
    let name = host.trim_start_matches('[').trim_end_matches(']');
    (name.to_string(), DEFAULT_PORT)
}

fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }
    // ENOMEM, ENFILE, EMFILE, ENOBUFS on Linux.
    matches!(e.raw_os_error(), Some(12 | 23 | 24 | 105))
}

fn panic_message(e: JoinError) -> String {
    let payload: Box<dyn Any + Send> = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
