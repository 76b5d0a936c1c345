//! Best-effort error detection for a protocol without a status line.
//!
//! The client sniffs the first bytes of a response once and asks an
//! [`ErrorDetector`] whether they look like a server error. The default
//! [`HeuristicDetector`] is policy, not law: swap it out, tune it, or turn
//! interception off entirely when it misfires on legitimate content.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dirent::Dirent;
use crate::item_type::ItemType;

/// The status inferred for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    Gone,
    Internal,
    NotImplemented,
    Unavailable,
    GeneralError,
    Empty,
}

impl Status {
    /// Map an HTTP-style status code embedded in response text.
    pub fn from_code(code: u16) -> Option<Status> {
        Some(match code {
            400 => Status::BadRequest,
            401 => Status::Unauthorized,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            408 => Status::RequestTimeout,
            410 => Status::Gone,
            500 => Status::Internal,
            501 => Status::NotImplemented,
            503 => Status::Unavailable,
            400..=499 => Status::BadRequest,
            500..=599 => Status::Internal,
            _ => return None,
        })
    }

    /// The closest `sysexits.h` code, for command-line callers.
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::BadRequest | Status::NotImplemented => 65,
            Status::GeneralError | Status::Empty => 65,
            Status::Unauthorized | Status::Forbidden => 77,
            Status::NotFound | Status::Gone | Status::Unavailable => 69,
            Status::RequestTimeout => 74,
            Status::Internal => 70,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::BadRequest => "bad request",
            Status::Unauthorized => "unauthorized",
            Status::Forbidden => "forbidden",
            Status::NotFound => "not found",
            Status::RequestTimeout => "request timeout",
            Status::Gone => "gone",
            Status::Internal => "internal error",
            Status::NotImplemented => "not implemented",
            Status::Unavailable => "unavailable",
            Status::GeneralError => "error",
            Status::Empty => "empty response",
        };
        f.write_str(s)
    }
}

/// A positive error classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub status: Status,
    pub message: String,
    pub confidence: f64,
}

/// Decides whether sniffed response bytes are a server-side error.
pub trait ErrorDetector: Send + Sync {
    fn detect(&self, sniff: &[u8]) -> Option<Detection>;
}

/// Maximum number of bytes the client reads for detection.
pub const SNIFF_LIMIT: usize = 1024;

/// The default content-sniffing policy.
#[derive(Debug, Clone)]
pub struct HeuristicDetector {
    /// Detections below this confidence are discarded.
    pub threshold: f64,
    /// Lower-case phrases that mark a short response as an error.
    pub phrases: Vec<(String, Status)>,
    /// Phrase matching only applies to responses at most this long.
    pub max_phrase_bytes: usize,
}

const DEFAULT_PHRASES: &[(&str, Status)] = &[
    ("not found", Status::NotFound),
    ("does not exist", Status::NotFound),
    ("doesn't exist", Status::NotFound),
    ("no such file", Status::NotFound),
    ("no such selector", Status::NotFound),
    ("forbidden", Status::Forbidden),
    ("permission denied", Status::Forbidden),
    ("access denied", Status::Forbidden),
    ("unauthorized", Status::Unauthorized),
    ("bad request", Status::BadRequest),
    ("invalid selector", Status::BadRequest),
    ("internal server error", Status::Internal),
    ("internal error", Status::Internal),
    ("not implemented", Status::NotImplemented),
    ("service unavailable", Status::Unavailable),
    ("temporarily unavailable", Status::Unavailable),
    ("timed out", Status::RequestTimeout),
];

impl Default for HeuristicDetector {
    fn default() -> Self {
        HeuristicDetector {
            threshold: 0.5,
            phrases: DEFAULT_PHRASES
                .iter()
                .map(|(p, s)| (p.to_string(), *s))
                .collect(),
            max_phrase_bytes: 512,
        }
    }
}

impl HeuristicDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_phrase(mut self, phrase: &str, status: Status) -> Self {
        self.phrases.push((phrase.to_ascii_lowercase(), status));
        self
    }

    fn classify_text(&self, text: &str) -> Option<(Status, bool)> {
        let lower = text.to_ascii_lowercase();
        let phrase = self
            .phrases
            .iter()
            .find(|(p, _)| lower.contains(p.as_str()))
            .map(|(_, s)| *s);
        let code = embedded_code(&lower).and_then(Status::from_code);
        match (code, phrase) {
            (Some(c), Some(_)) => Some((c, true)),
            (Some(c), None) => Some((c, false)),
            (None, Some(p)) => Some((p, false)),
            (None, None) => None,
        }
    }

    /// A type `3` directory line, optionally preceded by info lines.
    fn error_entry(&self, text: &str) -> Option<Detection> {
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match line.as_bytes()[0] {
                b'i' => continue,
                b'3' if line.contains('\t') => {
                    let message = line[1..].split('\t').next().unwrap_or("").trim();
                    let status = self
                        .classify_text(message)
                        .map(|(s, _)| s)
                        .unwrap_or(Status::GeneralError);
                    return Some(Detection {
                        status,
                        message: message.to_string(),
                        confidence: 0.9,
                    });
                }
                _ => return None,
            }
        }
        None
    }

    /// Gopher-II style `--` error lines, e.g. `--404 not found`.
    fn double_dash(&self, text: &str) -> Option<Detection> {
        let first = text.lines().next()?.trim_end_matches('\r');
        let rest = first.strip_prefix("--")?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let message = rest[digits.len()..].trim().to_string();
        let status = digits
            .parse::<u16>()
            .ok()
            .and_then(Status::from_code)
            .or_else(|| self.classify_text(&message).map(|(s, _)| s))
            .unwrap_or(Status::GeneralError);
        Some(Detection {
            status,
            message,
            confidence: 0.7,
        })
    }

    fn boilerplate(&self, sniff: &[u8], text: &str) -> Option<Detection> {
        if sniff.len() > self.max_phrase_bytes || sniff.contains(&0) {
            return None;
        }
        let body: Vec<&str> = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty() && *l != "." && !is_menu_line(l))
            .collect();
        if body.is_empty() || body.len() > 3 {
            return None;
        }
        let message = body.join(" ");
        let (status, both) = self.classify_text(&message)?;
        Some(Detection {
            status,
            message: message.trim().to_string(),
            confidence: if both { 0.75 } else { 0.6 },
        })
    }
}

impl ErrorDetector for HeuristicDetector {
    fn detect(&self, sniff: &[u8]) -> Option<Detection> {
        let found = if sniff.is_empty() {
            Some(Detection {
                status: Status::Empty,
                message: "empty response".to_string(),
                confidence: 0.5,
            })
        } else {
            let text = String::from_utf8_lossy(sniff);
            self.error_entry(&text)
                .or_else(|| self.double_dash(&text))
                .or_else(|| self.boilerplate(sniff, &text))
        };
        found.filter(|d| d.confidence >= self.threshold)
    }
}

/// A detector that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDetection;

impl ErrorDetector for NoDetection {
    fn detect(&self, _sniff: &[u8]) -> Option<Detection> {
        None
    }
}

/// A well-formed directory entry that is not an error item. Its numbers are
/// ports and selectors, not status codes.
fn is_menu_line(line: &str) -> bool {
    line.contains('\t')
        && Dirent::parse(line).map_or(false, |ent| ent.item_type != ItemType::ERROR)
}

/// First standalone three-digit 4xx/5xx number in `text`.
fn embedded_code(text: &str) -> Option<u16> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 3 && matches!(bytes[start], b'4' | b'5') {
                return text[start..i].parse().ok();
            }
        } else {
            i += 1;
        }
    }
    None
}
