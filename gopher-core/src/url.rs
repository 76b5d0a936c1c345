use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GopherError;
use crate::item_type::ItemType;

pub const DEFAULT_PORT: u16 = 70;

/// Everything outside the unreserved set is escaped, except `/`.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// A Gopher URL.
///
/// `gopher://<host>[:<port>][/<itemType><selector>[\t<search>[\t<plus>]]]`
///
/// A root URL carries no item type, selector, search or plus. Values are
/// immutable in spirit: derived URLs (see [`Url::as_meta`]) are new values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Url {
    pub hostname: String,
    pub port: u16,
    pub root: bool,
    pub item_type: ItemType,
    pub selector: String,
    pub search: String,
    pub plus: String,
}

/// Kinds of GopherIIbis metadata resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaType {
    Item,
    Dir,
}

impl MetaType {
    pub fn prefix(self) -> char {
        match self {
            MetaType::Item => '!',
            MetaType::Dir => '&',
        }
    }
}

impl Url {
    pub fn root(hostname: impl Into<String>, port: u16) -> Self {
        Url {
            hostname: hostname.into(),
            port,
            root: true,
            item_type: ItemType::default(),
            selector: String::new(),
            search: String::new(),
            plus: String::new(),
        }
    }

    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        item_type: ItemType,
        selector: impl Into<String>,
    ) -> Self {
        Url {
            hostname: hostname.into(),
            port,
            root: false,
            item_type,
            selector: selector.into(),
            search: String::new(),
            plus: String::new(),
        }
    }

    /// Parse a textual Gopher URL. The `gopher://` scheme is optional.
    pub fn parse(input: &str) -> Result<Url, GopherError> {
        let input = input.trim();
        let full = if scheme_len(input).is_some() {
            input.to_string()
        } else {
            format!("gopher://{}", input)
        };

        let parsed = ::url::Url::parse(&full).map_err(|e| GopherError::invalid_url(input, e))?;
        if parsed.scheme() != "gopher" {
            return Err(GopherError::invalid_url(
                input,
                format!("unsupported scheme {:?}", parsed.scheme()),
            ));
        }
        if parsed.fragment().is_some() {
            return Err(GopherError::invalid_url(input, "fragments are not allowed"));
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(GopherError::invalid_url(input, "userinfo is not allowed"));
        }
        if parsed.cannot_be_a_base() {
            return Err(GopherError::invalid_url(input, "opaque URLs are not allowed"));
        }

        let hostname = match parsed.host() {
            Some(::url::Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(::url::Host::Ipv4(a)) => a.to_string(),
            Some(::url::Host::Ipv6(a)) => a.to_string(),
            _ => return Err(GopherError::invalid_url(input, "missing host")),
        };
        let port = parsed.port().unwrap_or(DEFAULT_PORT);

        // The path is taken from the raw input rather than the parsed URL:
        // selectors are opaque and must not be dot-segment normalized.
        let after_scheme = &full[scheme_len(&full).map(|i| i + 3).unwrap_or(0)..];
        let path = after_scheme
            .find(|c: char| c == '/' || c == '?')
            .map(|i| &after_scheme[i..])
            .unwrap_or("");
        if path.starts_with('?') {
            return Err(GopherError::invalid_url(input, "query without an item type"));
        }
        let path = path.strip_prefix('/').unwrap_or(path);

        if path.is_empty() {
            return Ok(Url::root(hostname, port));
        }

        let decoded: Vec<u8> = percent_decode_str(path).collect();
        let item_type = ItemType(decoded[0]);
        let rest = String::from_utf8_lossy(&decoded[1..]);

        // Only the first two TABs are significant; the plus segment keeps the rest.
        let mut fields = rest.splitn(3, '\t');
        let selector = fields.next().unwrap_or("").to_string();
        let search = fields.next().unwrap_or("").to_string();
        let plus = fields.next().unwrap_or("").to_string();

        Ok(Url {
            hostname,
            port,
            root: false,
            item_type,
            selector,
            search,
            plus,
        })
    }

    /// `host:port` suitable for dialing. Port 0 means the default port.
    pub fn host_port(&self) -> String {
        let port = if self.port == 0 { DEFAULT_PORT } else { self.port };
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, port)
        } else {
            format!("{}:{}", self.hostname, port)
        }
    }

    /// The item type a request for this URL should be handled as.
    pub fn effective_item_type(&self) -> ItemType {
        if self.root {
            ItemType::DIR
        } else {
            self.item_type
        }
    }

    pub fn can_fetch(&self) -> bool {
        self.root || self.item_type.can_fetch()
    }

    /// The absolute web URL embedded in an `h` selector of the form
    /// `URL:http://...`.
    pub fn www(&self) -> Option<&str> {
        if self.item_type != ItemType::HTML {
            return None;
        }
        let sel = self.selector.strip_prefix('/').unwrap_or(&self.selector);
        if sel.len() < 4 || !sel.is_char_boundary(4) {
            return None;
        }
        let (prefix, rest) = sel.split_at(4);
        if prefix.eq_ignore_ascii_case("url:") && !rest.is_empty() {
            Some(rest)
        } else {
            None
        }
    }

    pub fn meta_type(&self) -> Option<MetaType> {
        match self.selector.as_bytes().first() {
            Some(b'!') => Some(MetaType::Item),
            Some(b'&') => Some(MetaType::Dir),
            _ => None,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.meta_type().is_some()
    }

    /// A copy of this URL addressing its metadata resource.
    pub fn as_meta(&self, kind: MetaType) -> Url {
        let mut selector = String::with_capacity(self.selector.len() + 1);
        selector.push(kind.prefix());
        selector.push_str(&self.selector);
        Url {
            hostname: self.hostname.clone(),
            port: self.port,
            root: false,
            item_type: ItemType::FILE,
            selector,
            search: String::new(),
            plus: String::new(),
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("gopher://")?;
        if self.hostname.contains(':') {
            write!(f, "[{}]", self.hostname)?;
        } else {
            f.write_str(&self.hostname)?;
        }
        if self.port != DEFAULT_PORT {
            write!(f, ":{}", self.port)?;
        }
        if self.root {
            return Ok(());
        }

        f.write_str("/")?;
        let it = [self.item_type.0];
        for chunk in percent_encoding::percent_encode(&it, SEGMENT) {
            f.write_str(chunk)?;
        }
        write!(f, "{}", utf8_percent_encode(&self.selector, SEGMENT))?;

        // A plus segment is only reachable through a search segment.
        if !self.plus.is_empty() {
            write!(
                f,
                "%09{}%09{}",
                utf8_percent_encode(&self.search, SEGMENT),
                utf8_percent_encode(&self.plus, SEGMENT)
            )?;
        } else if !self.search.is_empty() {
            write!(f, "%09{}", utf8_percent_encode(&self.search, SEGMENT))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Url {
    type Err = GopherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)
    }
}

/// Length of a leading `scheme://`'s scheme, if `s` has one.
fn scheme_len(s: &str) -> Option<usize> {
    let i = s.find("://")?;
    let scheme = &s[..i];
    let valid = scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(i)
}

/// Whether `s` is one of the placeholder hostnames real servers put in
/// entries that are not meant to be followed.
pub fn is_well_known_dummy_hostname(s: &str) -> bool {
    let s = s.trim();
    matches!(
        s,
        "error.host"
            | "fakeserver"
            | "Error"
            | "none"
            | "fake"
            | "(NULL)"
            | "(FALSE)"
            | "invalid"
            | "example"
            | "."
    ) || s.ends_with(".invalid")
        || s.ends_with(".example")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_url() {
        let u = Url::parse("gopher://gopher.floodgap.com:7070/1/world").unwrap();
        assert_eq!(u.hostname, "gopher.floodgap.com");
        assert_eq!(u.port, 7070);
        assert!(!u.root);
        assert_eq!(u.item_type, ItemType::DIR);
        assert_eq!(u.selector, "/world");
        assert_eq!(u.search, "");
        assert_eq!(u.plus, "");
    }

    #[test]
    fn scheme_and_port_default() {
        let u = Url::parse("sdf.org").unwrap();
        assert_eq!(u.hostname, "sdf.org");
        assert_eq!(u.port, 70);
        assert!(u.root);

        let u = Url::parse("localhost:7070/0/readme").unwrap();
        assert_eq!(u.hostname, "localhost");
        assert_eq!(u.port, 7070);
        assert_eq!(u.item_type, ItemType::FILE);
        assert_eq!(u.selector, "/readme");
    }

    #[test]
    fn slash_only_path_is_root() {
        let u = Url::parse("gopher://example.org/").unwrap();
        assert!(u.root);
        assert_eq!(u.selector, "");
        assert_eq!(u.to_string(), "gopher://example.org");
    }

    #[test]
    fn ipv6_host() {
        let u = Url::parse("gopher://[::]:70/1/yep").unwrap();
        assert_eq!(u.hostname, "::");
        assert_eq!(u.port, 70);
        assert_eq!(u.to_string(), "gopher://[::]/1/yep");
        assert_eq!(u.host_port(), "[::]:70");
    }

    #[test]
    fn search_and_plus_split_on_first_two_tabs() {
        let u = Url::parse("gopher://h/7/v2/vs%09term%09a%09b").unwrap();
        assert_eq!(u.item_type, ItemType::SEARCH);
        assert_eq!(u.selector, "/v2/vs");
        assert_eq!(u.search, "term");
        assert_eq!(u.plus, "a\tb");
    }

    #[test]
    fn rejects_disallowed_components() {
        for bad in [
            "gopher://h/1/x#frag",
            "gopher://user:pw@h/1/x",
            "http://example.com/",
            "gopher://h:notaport/1",
        ] {
            let err = Url::parse(bad).unwrap_err();
            assert!(
                matches!(err, GopherError::InvalidUrl { .. }),
                "{} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn bare_query_is_rejected() {
        for input in ["gopher://example.org?x", "example.org:7070?x"] {
            let err = Url::parse(input).unwrap_err();
            assert!(matches!(err, GopherError::InvalidUrl { .. }), "{:?}", err);
        }
        let u = Url::parse("gopher://example.org/1/a?b").unwrap();
        assert_eq!(u.selector, "/a?b");
    }

    #[test]
    fn selectors_are_not_normalized() {
        let u = Url::parse("gopher://h/1/a/../b").unwrap();
        assert_eq!(u.selector, "/a/../b");
    }

    #[test]
    fn round_trip() {
        let cases = vec![
            Url::new("example.org", 70, ItemType::DIR, "/world"),
            Url::new("example.org", 7070, ItemType::FILE, "/with space/and%percent"),
            Url {
                search: "some terms".into(),
                ..Url::new("example.org", 70, ItemType::SEARCH, "/v2/vs")
            },
            Url {
                search: "q".into(),
                plus: "+ extra\tfield".into(),
                ..Url::new("example.org", 70, ItemType::SEARCH, "/s")
            },
            Url::new("example.org", 70, ItemType(b'+'), "?odd#chars"),
            Url::new("example.org", 70, ItemType(0xe9), "/latin"),
            Url::new("::1", 7070, ItemType::BINARY, "/bin"),
        ];
        for u in cases {
            let s = u.to_string();
            let back = Url::parse(&s).unwrap_or_else(|e| panic!("{}: {}", s, e));
            assert_eq!(back, u, "round trip through {}", s);
        }
    }

    #[test]
    fn plus_forces_search_segment() {
        let u = Url {
            plus: "+".into(),
            ..Url::new("h", 70, ItemType::DIR, "/x")
        };
        assert_eq!(u.to_string(), "gopher://h/1/x%09%09%2B");
    }

    #[test]
    fn www_selector() {
        let u = Url::parse("gopher://gopher.floodgap.com/hURL:http://example.com/").unwrap();
        assert_eq!(u.www(), Some("http://example.com/"));

        let u = Url::new("h", 70, ItemType::HTML, "/url:https://x.org");
        assert_eq!(u.www(), Some("https://x.org"));

        let u = Url::new("h", 70, ItemType::FILE, "URL:http://x.org");
        assert_eq!(u.www(), None);

        let u = Url::parse("example.org/hURL:http://x.org").unwrap();
        assert_eq!(u.hostname, "example.org");
        assert_eq!(u.www(), Some("http://x.org"));
    }

    #[test]
    fn meta_urls_are_new_values() {
        let u = Url::new("h", 70, ItemType::DIR, "/docs");
        let m = u.as_meta(MetaType::Dir);
        assert_eq!(m.selector, "&/docs");
        assert_eq!(m.meta_type(), Some(MetaType::Dir));
        assert_eq!(u.selector, "/docs");
        assert!(!u.is_meta());
    }

    #[test]
    fn dummy_hostnames() {
        assert!(is_well_known_dummy_hostname("error.host"));
        assert!(is_well_known_dummy_hostname(" (NULL) "));
        assert!(is_well_known_dummy_hostname("foo.invalid"));
        assert!(!is_well_known_dummy_hostname("gopher.floodgap.com"));
    }
}
