use std::fmt;
use std::net::SocketAddr;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::url::Url;

/// A request body stream.
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

/// A Gopher request, as sent by the client or received by the server.
pub struct Request {
    pub url: Url,
    /// Sent after the request line when present; the line's data flag is `1`.
    pub body: Option<Body>,
    /// Gopher+ view. Mostly empty.
    pub view: String,
    /// Set by the server only.
    pub remote_addr: Option<SocketAddr>,
    /// Aborts an in-flight dial when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl Request {
    pub fn new(url: Url) -> Self {
        Request {
            url,
            body: None,
            view: String::new(),
            remote_addr: None,
            cancel: None,
        }
    }

    pub fn with_body(mut self, body: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = view.into();
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// The wire request line: `selector\tsearch\tview{0|1}\r\n`.
    ///
    /// The URL's plus segment stands in for the view when no view is set.
    /// The trailing flag is `1` when a body follows.
    pub fn write_line(&self) -> String {
        let url = &self.url;
        let view = if self.view.is_empty() {
            &url.plus
        } else {
            &self.view
        };
        let flag = if self.body.is_some() { '1' } else { '0' };
        let mut line = String::with_capacity(url.selector.len() + url.search.len() + view.len() + 5);
        line.push_str(&url.selector);
        line.push('\t');
        line.push_str(&url.search);
        line.push('\t');
        line.push_str(view);
        line.push(flag);
        line.push_str("\r\n");
        line
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("body", &self.body.as_ref().map(|_| ".."))
            .field("view", &self.view)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
