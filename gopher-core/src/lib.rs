//! A Gopher protocol engine.
//!
//! [`Client`] dials, sends a selector and hands back a typed [`Response`]:
//! raw bytes, dot-protocol text, a lazily parsed directory, or a decoded
//! uuencoded file. Gopher has no status line, so the first bytes of every
//! response are sniffed once for server error boilerplate unless interception
//! is turned off. [`Server`] frames inbound requests and passes the raw
//! connection to a [`Handler`].

pub mod client;
pub mod conn;
pub mod dirent;
pub mod dotproto;
pub mod error;
pub mod item_type;
pub mod load;
pub mod recorder;
pub mod registry;
pub mod request;
pub mod response;
pub mod server;
pub mod status;
pub mod url;
pub mod uuencode;

pub use client::{Client, DEFAULT_TIMEOUT};
pub use conn::{Connection, Dialer, TcpDialer};
#[cfg(feature = "tls")]
pub use conn::TlsDialer;
pub use dirent::Dirent;
pub use error::{GopherError, ProtocolError};
pub use item_type::{ItemClass, ItemType, ItemTypeSet};
pub use load::{LoadReport, LoadTest};
pub use recorder::{Entry, EntryLog, Recorder, Recording};
pub use request::Request;
pub use response::{
    BinaryResponse, DirResponse, Response, ResponseClass, TextResponse, UuEncodedResponse,
};
pub use server::{Handler, MetaHandler, ResponseSink, Server, ServerConfig, ServerInfo};
pub use status::{Detection, ErrorDetector, HeuristicDetector, Status};
pub use crate::url::{MetaType, Url};
