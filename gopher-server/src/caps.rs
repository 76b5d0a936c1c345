use std::fmt::Write as _;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use gopher_core::{MetaHandler, Request, ResponseSink, ServerInfo};

/// Seconds a client may cache the caps file.
const EXPIRE_CAPS_AFTER: u64 = 3600;

/// Answers metadata selectors with a description of the server.
pub struct CapsHandler {
    caps: String,
}

impl CapsHandler {
    pub fn new(info: &ServerInfo) -> Self {
        CapsHandler {
            caps: render(info),
        }
    }
}

#[async_trait]
impl MetaHandler for CapsHandler {
    async fn serve_gopher_meta(&self, w: &mut ResponseSink, req: Request) {
        debug!(selector = %req.url.selector, "meta request");
        if let Err(e) = w.write_all(self.caps.as_bytes()).await {
            warn!(error = %e, "writing caps failed");
        }
    }
}

/// The caps file: `key=value` lines in blank-line separated groups,
/// dot-terminated.
pub fn render(info: &ServerInfo) -> String {
    let mut out = String::from("CAPS\r\n\r\n");
    let groups: [&[(&str, String)]; 3] = [
        &[
            ("CapsVersion", "1".to_string()),
            ("ExpireCapsAfter", EXPIRE_CAPS_AFTER.to_string()),
        ],
        &[
            ("PathDelimeter", "/".to_string()),
            ("PathIdentity", ".".to_string()),
            ("PathParent", "..".to_string()),
            ("PathParentDouble", "FALSE".to_string()),
            ("PathEscapeCharacter", "\\".to_string()),
            ("PathKeepPreDelimeter", "FALSE".to_string()),
        ],
        &[
            ("ServerSoftware", info.software.clone()),
            ("ServerSoftwareVersion", info.version.clone()),
            ("ServerArchitecture", info.architecture.clone()),
            ("ServerDescription", info.description.clone()),
            ("ServerGeolocationString", info.geolocation.clone()),
            ("ServerAdmin", info.admin_email.clone()),
        ],
    ];
    for (i, group) in groups.iter().enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        for (key, value) in group.iter() {
            if value.is_empty() {
                continue;
            }
            // Values are single-line.
            let value = value.replace(['\r', '\n'], " ");
            let _ = write!(out, "{}={}\r\n", key, value);
        }
    }
    out.push_str(".\r\n");
    out
}
