use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::conn::{Dialer, Exchange, TcpDialer};
use crate::error::{GopherError, ProtocolError};
use crate::item_type::ItemTypeSet;
use crate::recorder::Recorder;
use crate::request::{Body, Request};
use crate::response::{
    select_variant, BinaryResponse, DirResponse, Response, TextResponse, UuEncodedResponse,
    Variant,
};
use crate::status::{ErrorDetector, HeuristicDetector, SNIFF_LIMIT};
use crate::url::{Url, DEFAULT_PORT};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A Gopher client.
///
/// Cheap to clone and safe to share: nothing about a request is stored on the
/// client, so any number of tasks can drive requests through one value.
#[derive(Clone)]
pub struct Client {
    timeout: Option<Duration>,
    extra_binary_types: ItemTypeSet,
    intercept_errors: bool,
    detector: Arc<dyn ErrorDetector>,
    recorder: Option<Arc<dyn Recorder>>,
    dialer: Arc<dyn Dialer>,
}

impl Default for Client {
    fn default() -> Self {
        Client {
            timeout: Some(DEFAULT_TIMEOUT),
            extra_binary_types: ItemTypeSet::new(),
            intercept_errors: true,
            detector: Arc::new(HeuristicDetector::default()),
            recorder: None,
            dialer: Arc::new(TcpDialer),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("timeout", &self.timeout)
            .field("extra_binary_types", &self.extra_binary_types)
            .field("intercept_errors", &self.intercept_errors)
            .field("recorder", &self.recorder.is_some())
            .finish()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the dial, the request write and every read wait. A zero
    /// duration disables the bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Item types to read raw and treat as fetchable, whatever the table says.
    pub fn with_extra_binary_types(mut self, types: ItemTypeSet) -> Self {
        self.extra_binary_types = types;
        self
    }

    pub fn with_intercept_errors(mut self, intercept: bool) -> Self {
        self.intercept_errors = intercept;
        self
    }

    pub fn with_detector(mut self, detector: impl ErrorDetector + 'static) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    pub fn with_recorder(mut self, recorder: impl Recorder + 'static) -> Self {
        self.recorder = Some(Arc::new(recorder));
        self
    }

    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The decoding a request for `url` gets from [`Client::fetch`].
    pub fn variant_for(&self, url: &Url) -> Variant {
        select_variant(url.item_type, url.root, &self.extra_binary_types)
    }

    /// Fetch `req`, decoding the response according to its item type.
    pub async fn fetch(&self, req: Request) -> Result<Response, GopherError> {
        let variant = self.variant_for(&req.url);
        let ex = self.send(req, self.intercept_errors).await?;
        Ok(Response::new(variant, ex))
    }

    pub async fn fetch_url(&self, url: &Url) -> Result<Response, GopherError> {
        self.fetch(Request::new(url.clone())).await
    }

    pub async fn dir(&self, req: Request) -> Result<DirResponse, GopherError> {
        let ex = self.send(req, self.intercept_errors).await?;
        Ok(DirResponse::new(ex))
    }

    /// Run a type `7` search with `query` as the search terms.
    pub async fn search(&self, url: &Url, query: &str) -> Result<DirResponse, GopherError> {
        let mut url = url.clone();
        url.search = query.to_string();
        self.dir(Request::new(url)).await
    }

    pub async fn text(&self, req: Request) -> Result<TextResponse, GopherError> {
        let ex = self.send(req, self.intercept_errors).await?;
        Ok(TextResponse::new(ex))
    }

    pub async fn binary(&self, req: Request) -> Result<BinaryResponse, GopherError> {
        let ex = self.send(req, self.intercept_errors).await?;
        Ok(BinaryResponse::new(ex))
    }

    pub async fn uuencoded(&self, req: Request) -> Result<UuEncodedResponse, GopherError> {
        let ex = self.send(req, self.intercept_errors).await?;
        Ok(UuEncodedResponse::new(ex))
    }

    /// The response bytes exactly as sent, with no error interception.
    pub async fn raw(&self, req: Request) -> Result<BinaryResponse, GopherError> {
        let ex = self.send(req, false).await?;
        Ok(BinaryResponse::new(ex))
    }

    async fn send(&self, mut req: Request, intercept: bool) -> Result<Exchange, GopherError> {
        let url = req.url.clone();
        if !(url.can_fetch() || self.extra_binary_types.contains(url.item_type)) {
            return Err(GopherError::Unfetchable(url));
        }
        let port = if url.port == 0 { DEFAULT_PORT } else { url.port };
        let at = SystemTime::now();

        debug!(url = %url, "dialing");
        let dial = bounded(self.timeout, "dial", self.dialer.dial(&url.hostname, port));
        let conn = match req.cancel.take() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(GopherError::Cancelled),
                res = dial => res,
            },
            None => dial.await,
        }
        .map_err(|e| GopherError::dial(url.host_port(), e))?;

        let recording = self
            .recorder
            .as_ref()
            .map(|r| r.begin_recording(&url, at));
        let mut ex = Exchange::new(url.clone(), conn, self.timeout, recording);

        let line = req.write_line();
        let body = req.body.take();
        let written = bounded(self.timeout, "write", write_request(&mut ex, &line, body)).await;
        if let Err(e) = written {
            discard(&mut ex).await;
            return Err(GopherError::write(e));
        }
        debug!(url = %url, bytes = line.len(), "request sent");

        if !intercept {
            return Ok(ex);
        }

        // One read only: a second could block on a server that has said all
        // it is going to say.
        let mut sniff = vec![0u8; SNIFF_LIMIT];
        let n = match ex.read(&mut sniff).await {
            Ok(n) => n,
            Err(e) => {
                discard(&mut ex).await;
                return Err(GopherError::read(e));
            }
        };
        sniff.truncate(n);

        if let Some(found) = self.detector.detect(&sniff) {
            debug!(
                url = %url,
                status = %found.status,
                confidence = found.confidence,
                "response looks like an error"
            );
            ex.set_status(found.status, &found.message);
            discard(&mut ex).await;
            return Err(ProtocolError {
                url,
                status: found.status,
                message: found.message,
                confidence: found.confidence,
                raw: sniff,
            }
            .into());
        }

        ex.unread(&sniff);
        Ok(ex)
    }
}

async fn write_request(ex: &mut Exchange, line: &str, body: Option<Body>) -> io::Result<()> {
    ex.write_all(line.as_bytes()).await?;
    if let Some(mut body) = body {
        tokio::io::copy(&mut body, ex).await?;
    }
    ex.flush().await
}

async fn discard(ex: &mut Exchange) {
    if let Err(e) = ex.close().await {
        debug!(url = %ex.url(), error = %e, "close after failed request");
    }
}

async fn bounded<T>(
    limit: Option<Duration>,
    what: &str,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", what, d),
            )),
        },
        None => fut.await,
    }
}
