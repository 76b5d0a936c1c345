use serde::{Deserialize, Serialize};
use std::fmt;

use crate::item_type::{ItemClass, ItemType};
use crate::url::{is_well_known_dummy_hostname, Url, DEFAULT_PORT};

/// One parsed line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirent {
    pub item_type: ItemType,
    pub display: String,
    /// Where the entry points. For info lines this is mostly empty.
    pub url: Url,
    /// The port as written; `None` when the field was empty or absent.
    pub port: Option<u16>,
    pub plus: bool,
    /// Whether the entry is worth following.
    pub valid: bool,
    /// Why the entry is not valid, if it isn't.
    pub error: String,
    /// The line as received.
    pub raw: String,
}

/// A directory line that violates the entry format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryError {
    pub reason: String,
}

impl EntryError {
    fn new(reason: impl Into<String>) -> Self {
        EntryError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for EntryError {}

const DISPLAY: usize = 0;
const SELECTOR: usize = 1;
const HOSTNAME: usize = 2;
const PORT: usize = 3;
const PLUS: usize = 4;

impl Dirent {
    /// Parse one decoded directory line (without its line ending).
    ///
    /// `<type><display>\t<selector>\t<hostname>\t<port>[\t<plus>]`
    pub fn parse(line: &str) -> Result<Dirent, EntryError> {
        let bytes = line.as_bytes();
        let Some(&first) = bytes.first() else {
            return Err(EntryError::new("empty line"));
        };
        let item_type = ItemType(first);
        let need = if item_type == ItemType::INFO { 1 } else { 4 };

        let mut ent = Dirent {
            item_type,
            display: String::new(),
            url: Url::new(String::new(), DEFAULT_PORT, item_type, String::new()),
            port: None,
            plus: false,
            valid: true,
            error: String::new(),
            raw: line.to_string(),
        };

        // A non-ASCII first byte takes the whole char with it.
        let skip = line.chars().next().map_or(0, char::len_utf8);
        let body = &line[skip..];
        let mut field = 0;
        let mut start = 0;
        let body_bytes = body.as_bytes();
        for i in 0..=body_bytes.len() {
            if i < body_bytes.len() && body_bytes[i] != b'\t' {
                continue;
            }
            let seg = &body[start..i];
            match field {
                DISPLAY => ent.display = seg.to_string(),
                SELECTOR => ent.url.selector = seg.to_string(),
                HOSTNAME => ent.url.hostname = seg.to_string(),
                PORT => {
                    let p = seg.trim();
                    if !p.is_empty() {
                        let port = p
                            .parse::<u16>()
                            .map_err(|_| EntryError::new(format!("invalid port {:?}", seg)))?;
                        ent.port = Some(port);
                        ent.url.port = port;
                    }
                }
                PLUS => match seg {
                    "+" => ent.plus = true,
                    "" => {}
                    other => {
                        return Err(EntryError::new(format!("invalid plus field {:?}", other)))
                    }
                },
                _ => return Err(EntryError::new("extra fields")),
            }
            field += 1;
            start = i + 1;
        }

        if field < need {
            return Err(EntryError::new(format!(
                "expected at least {} fields, found {}",
                need, field
            )));
        }

        if item_type == ItemType::ERROR {
            ent.valid = false;
            ent.error = ent.display.clone();
        } else if item_type.class() != ItemClass::Info
            && item_type.can_fetch()
            && is_well_known_dummy_hostname(&ent.url.hostname)
        {
            ent.valid = false;
            ent.error = format!("placeholder hostname {:?}", ent.url.hostname);
        }
        Ok(ent)
    }

    /// An info line.
    pub fn info(text: impl Into<String>) -> Dirent {
        let display = text.into();
        Dirent {
            item_type: ItemType::INFO,
            raw: String::new(),
            url: Url::new(String::new(), DEFAULT_PORT, ItemType::INFO, String::new()),
            port: None,
            plus: false,
            valid: true,
            error: String::new(),
            display,
        }
    }

    /// An entry pointing at `url`.
    pub fn link(display: impl Into<String>, url: Url) -> Dirent {
        Dirent {
            item_type: url.effective_item_type(),
            display: display.into(),
            port: Some(url.port),
            url,
            plus: false,
            valid: true,
            error: String::new(),
            raw: String::new(),
        }
    }

    /// The entry in wire form, with a trailing CRLF.
    pub fn to_line(&self) -> String {
        let (host, port) = if self.item_type == ItemType::INFO && self.url.hostname.is_empty() {
            ("fake", 0)
        } else {
            (self.url.hostname.as_str(), self.port.unwrap_or(self.url.port))
        };
        let mut line = format!(
            "{}{}\t{}\t{}\t{}",
            self.item_type.0 as char,
            self.display.replace(['\t', '\r', '\n'], " "),
            self.url.selector,
            host,
            port
        );
        if self.plus {
            line.push_str("\t+");
        }
        line.push_str("\r\n");
        line
    }
}
