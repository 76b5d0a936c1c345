//! Tee recording of request and response bytes.
//!
//! A [`Recorder`] opens one [`Recording`] per exchange. The exchange copies
//! every byte it writes into the request sink and every byte it reads into the
//! response sink, then calls [`Recording::done`] exactly once when the
//! response is closed or dropped.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use crate::status::Status;
use crate::url::Url;

pub trait Recorder: Send + Sync {
    fn begin_recording(&self, url: &Url, at: SystemTime) -> Box<dyn Recording>;
}

pub trait Recording: Send {
    fn request_sink(&mut self) -> &mut dyn io::Write;
    fn response_sink(&mut self) -> &mut dyn io::Write;
    fn set_status(&mut self, status: Status, message: &str);
    fn done(self: Box<Self>, at: SystemTime);
}

/// One recorded exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub url: Url,
    pub at: SystemTime,
    pub elapsed: Duration,
    pub status: Status,
    pub message: String,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// An in-memory recorder that appends finished exchanges in completion order.
///
/// Cloning shares the underlying log, so one `EntryLog` can record many
/// concurrent exchanges.
#[derive(Debug, Clone, Default)]
pub struct EntryLog {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl EntryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Recorder for EntryLog {
    fn begin_recording(&self, url: &Url, at: SystemTime) -> Box<dyn Recording> {
        Box::new(EntryRecording {
            log: Arc::clone(&self.entries),
            entry: Entry {
                url: url.clone(),
                at,
                elapsed: Duration::ZERO,
                status: Status::Ok,
                message: String::new(),
                request: Vec::new(),
                response: Vec::new(),
            },
        })
    }
}

struct EntryRecording {
    log: Arc<Mutex<Vec<Entry>>>,
    entry: Entry,
}

impl Recording for EntryRecording {
    fn request_sink(&mut self) -> &mut dyn io::Write {
        &mut self.entry.request
    }

    fn response_sink(&mut self) -> &mut dyn io::Write {
        &mut self.entry.response
    }

    fn set_status(&mut self, status: Status, message: &str) {
        self.entry.status = status;
        self.entry.message = message.to_string();
    }

    fn done(self: Box<Self>, at: SystemTime) {
        let EntryRecording { log, mut entry } = *self;
        entry.elapsed = at.duration_since(entry.at).unwrap_or_default();
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item_type::ItemType;
    use std::io::Write;

    #[test]
    fn done_appends_once_per_recording() {
        let log = EntryLog::new();
        let url = Url::new("localhost", 70, ItemType::FILE, "/a");
        let start = SystemTime::now();

        let mut rec = log.begin_recording(&url, start);
        rec.request_sink().write_all(b"/a\r\n").unwrap();
        rec.response_sink().write_all(b"hello").unwrap();
        rec.set_status(Status::NotFound, "gone fishing");
        assert!(log.is_empty());
        rec.done(start + Duration::from_millis(20));

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.url, url);
        assert_eq!(e.request, b"/a\r\n");
        assert_eq!(e.response, b"hello");
        assert_eq!(e.status, Status::NotFound);
        assert_eq!(e.message, "gone fishing");
        assert_eq!(e.elapsed, Duration::from_millis(20));
    }

    #[test]
    fn shared_across_threads() {
        let log = EntryLog::new();
        let url = Url::root("localhost", 70);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = log.clone();
                let url = url.clone();
                std::thread::spawn(move || {
                    let rec = log.begin_recording(&url, SystemTime::now());
                    rec.done(SystemTime::now());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 8);
    }

    #[test]
    fn entries_serialize() {
        let log = EntryLog::new();
        let rec = log.begin_recording(&Url::root("h", 70), SystemTime::UNIX_EPOCH);
        rec.done(SystemTime::UNIX_EPOCH);
        let json = serde_json::to_string(&log.entries()[0]).unwrap();
        assert!(json.contains("\"hostname\":\"h\""));
    }
}
