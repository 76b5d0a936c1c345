use serde::{Deserialize, Serialize};
use std::fmt;

/// A single-byte Gopher item type.
///
/// Every byte value is a valid item type; bytes the classification table does
/// not know about classify as [`ItemClass::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemType(pub u8);

/// Coarse content class of an item type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemClass {
    Binary,
    Directory,
    Text,
    Error,
    Info,
    Unknown,
    /// Out-of-band sessions (telnet, tn3270, CSO) a byte stream cannot represent.
    External,
}

impl ItemType {
    pub const FILE: ItemType = ItemType(b'0');
    pub const DIR: ItemType = ItemType(b'1');
    /// CCSO nameserver.
    pub const CSO: ItemType = ItemType(b'2');
    pub const ERROR: ItemType = ItemType(b'3');
    /// Pre OS X Mac BinHex.
    pub const BINHEX: ItemType = ItemType(b'4');
    /// Read until the connection closes.
    pub const DOS_ARCHIVE: ItemType = ItemType(b'5');
    pub const UUENCODED: ItemType = ItemType(b'6');
    pub const SEARCH: ItemType = ItemType(b'7');
    pub const TELNET: ItemType = ItemType(b'8');
    /// Read until the connection closes.
    pub const BINARY: ItemType = ItemType(b'9');
    /// Duplicate of the previous primary server entry.
    pub const DUPLICATE: ItemType = ItemType(b'+');
    pub const GIF: ItemType = ItemType(b'g');
    pub const IMAGE: ItemType = ItemType(b'I');
    pub const TN3270: ItemType = ItemType(b'T');

    // Non-canonical, but common in the wild.
    pub const DOC: ItemType = ItemType(b'd');
    pub const HTML: ItemType = ItemType(b'h');
    pub const INFO: ItemType = ItemType(b'i');
    pub const SOUND: ItemType = ItemType(b's');
    pub const PNG: ItemType = ItemType(b'p');
    pub const MOVIE: ItemType = ItemType(b';');
    pub const CALENDAR: ItemType = ItemType(b'c');
    pub const MBOX: ItemType = ItemType(b'M');
    pub const XML: ItemType = ItemType(b'x');

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn class(self) -> ItemClass {
        TABLE[self.0 as usize].class
    }

    /// Whether the client can open a byte stream for this type.
    pub fn can_fetch(self) -> bool {
        TABLE[self.0 as usize].can_fetch
    }

    /// Whether a response of this type should be read raw until the
    /// connection closes.
    pub fn is_binary(self) -> bool {
        TABLE[self.0 as usize].binary
    }

    pub fn is_search(self) -> bool {
        self == ItemType::SEARCH
    }

    pub fn name(self) -> &'static str {
        TABLE[self.0 as usize].name
    }
}

impl From<u8> for ItemType {
    fn from(b: u8) -> Self {
        ItemType(b)
    }
}

impl From<char> for ItemType {
    fn from(c: char) -> Self {
        if c.is_ascii() {
            ItemType(c as u8)
        } else {
            ItemType(b'?')
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0 as char)
    }
}

#[derive(Clone, Copy)]
struct ItemInfo {
    class: ItemClass,
    can_fetch: bool,
    binary: bool,
    name: &'static str,
}

const UNKNOWN: ItemInfo = ItemInfo {
    class: ItemClass::Unknown,
    can_fetch: false,
    binary: true,
    name: "Unknown",
};

const fn info(class: ItemClass, name: &'static str) -> ItemInfo {
    let (can_fetch, binary) = match class {
        ItemClass::Binary => (true, true),
        ItemClass::Directory | ItemClass::Text => (true, false),
        ItemClass::Error | ItemClass::Info | ItemClass::External => (false, false),
        ItemClass::Unknown => (false, true),
    };
    ItemInfo {
        class,
        can_fetch,
        binary,
        name,
    }
}

const fn build_table() -> [ItemInfo; 256] {
    let mut t = [UNKNOWN; 256];
    t[b'0' as usize] = info(ItemClass::Text, "TextFile");
    t[b'1' as usize] = info(ItemClass::Directory, "Menu");
    t[b'2' as usize] = info(ItemClass::External, "CSO");
    t[b'3' as usize] = info(ItemClass::Error, "Error");
    t[b'4' as usize] = info(ItemClass::Binary, "BinHex");
    t[b'5' as usize] = info(ItemClass::Binary, "DOSArchive");
    // UUEncoded content is dot-framed text on the wire.
    t[b'6' as usize] = ItemInfo {
        class: ItemClass::Binary,
        can_fetch: true,
        binary: false,
        name: "UUEncoded",
    };
    t[b'7' as usize] = info(ItemClass::Directory, "Search");
    t[b'8' as usize] = info(ItemClass::External, "Telnet");
    t[b'9' as usize] = info(ItemClass::Binary, "Binary");
    t[b'+' as usize] = ItemInfo {
        class: ItemClass::Unknown,
        can_fetch: false,
        binary: true,
        name: "Duplicate",
    };
    t[b'g' as usize] = info(ItemClass::Binary, "Gif");
    t[b'I' as usize] = info(ItemClass::Binary, "Image");
    t[b'T' as usize] = info(ItemClass::External, "TN3270");
    t[b'd' as usize] = info(ItemClass::Binary, "Doc");
    t[b's' as usize] = info(ItemClass::Binary, "Sound");
    t[b'p' as usize] = info(ItemClass::Binary, "Png");
    t[b';' as usize] = info(ItemClass::Binary, "Movie");
    t[b'c' as usize] = info(ItemClass::Text, "Calendar");
    t[b'M' as usize] = info(ItemClass::Text, "Mbox");
    t[b'x' as usize] = info(ItemClass::Text, "Xml");
    t[b'i' as usize] = info(ItemClass::Info, "Info");

    // HTML is text, but servers (floodgap among them) send it without
    // dot-protocol framing, so it is read raw.
    t[b'h' as usize] = ItemInfo {
        class: ItemClass::Text,
        can_fetch: true,
        binary: true,
        name: "Html",
    };
    t
}

static TABLE: [ItemInfo; 256] = build_table();

/// A set of item types, one bit per byte value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemTypeSet([u64; 4]);

impl ItemTypeSet {
    pub const fn new() -> Self {
        ItemTypeSet([0; 4])
    }

    /// Every byte of `s` becomes a member. `"gI"` is `{'g', 'I'}`.
    pub fn from_bytes(s: &[u8]) -> Self {
        let mut set = Self::new();
        for &b in s {
            set.insert(ItemType(b));
        }
        set
    }

    pub fn insert(&mut self, it: ItemType) {
        let b = it.0 as usize;
        self.0[b / 64] |= 1u64 << (b % 64);
    }

    pub fn remove(&mut self, it: ItemType) {
        let b = it.0 as usize;
        self.0[b / 64] &= !(1u64 << (b % 64));
    }

    pub fn contains(&self, it: ItemType) -> bool {
        let b = it.0 as usize;
        self.0[b / 64] & (1u64 << (b % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }
}

impl FromIterator<ItemType> for ItemTypeSet {
    fn from_iter<T: IntoIterator<Item = ItemType>>(iter: T) -> Self {
        let mut set = Self::new();
        for it in iter {
            set.insert(it);
        }
        set
    }
}
