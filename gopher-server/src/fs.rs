use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use gopher_core::{Dirent, Handler, ItemType, Request, ResponseSink, Url};

/// Files with these extensions are listed as type 9 and streamed raw.
const BINARY_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "zip", "tar", "gz", "exe", "bin", "pdf",
];

const GOPHERMAP: &str = ".gophermap";
const CAPS_SELECTOR: &str = "caps.txt";

/// A handler that serves a directory tree.
///
/// Directories become menus (type 1), text files are sent dot-stuffed
/// (type 0) and binary files are streamed as-is. A `.gophermap` in a
/// directory replaces its generated menu.
pub struct FsHandler {
    root: PathBuf,
    binary_extensions: Vec<String>,
    caps: Option<String>,
}

impl FsHandler {
    /// `root` must exist and be a directory. `binary_extensions` replaces the
    /// built-in list when given.
    pub fn new(root: &Path, binary_extensions: Option<Vec<String>>) -> io::Result<Self> {
        let root = std::fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root path is not a directory: {}", root.display()),
            ));
        }
        let binary_extensions = match binary_extensions {
            Some(exts) => exts
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            None => BINARY_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        };
        Ok(FsHandler {
            root,
            binary_extensions,
            caps: None,
        })
    }

    /// Answer `caps.txt` with `caps` unless the tree has its own.
    pub fn with_caps(mut self, caps: String) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a selector onto a path under the root. Anything that could climb
    /// out of it is refused.
    fn resolve(&self, selector: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for part in Path::new(selector.trim_start_matches('/')).components() {
            match part {
                Component::Normal(p) => path.push(p),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(path)
    }

    fn item_type_for(&self, path: &Path) -> ItemType {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "gif" => ItemType::GIF,
            "png" | "jpg" | "jpeg" | "bmp" => ItemType::IMAGE,
            "html" | "htm" => ItemType::HTML,
            "uue" => ItemType::UUENCODED,
            _ if self.binary_extensions.iter().any(|b| *b == ext) => ItemType::BINARY,
            _ => ItemType::FILE,
        }
    }

    async fn serve(&self, w: &mut ResponseSink, url: &Url) -> io::Result<()> {
        let selector = url.selector.as_str();
        let Some(path) = self.resolve(selector) else {
            warn!(selector, "selector escapes the root");
            return w.write_all(error_line("invalid selector").as_bytes()).await;
        };
        let path = match fs::canonicalize(&path).await {
            Ok(p) if p.starts_with(&self.root) => p,
            Ok(_) => {
                warn!(selector, "selector escapes the root");
                return w.write_all(error_line("invalid selector").as_bytes()).await;
            }
            Err(_) => {
                if let Some(caps) = self.caps_for(selector) {
                    return w.write_all(caps.as_bytes()).await;
                }
                debug!(selector, "not found");
                return w.write_all(error_line("not found").as_bytes()).await;
            }
        };

        let meta = fs::metadata(&path).await?;
        if meta.is_dir() {
            let mut entries = self.menu(&path, url).await?;
            if !url.search.is_empty() {
                let needle = url.search.to_lowercase();
                entries.retain(|e| e.display.to_lowercase().contains(&needle));
            }
            let mut out = String::new();
            for entry in &entries {
                out.push_str(&entry.to_line());
            }
            out.push_str(".\r\n");
            w.write_all(out.as_bytes()).await
        } else if self.item_type_for(&path).is_binary() {
            let mut file = fs::File::open(&path).await?;
            tokio::io::copy(&mut file, w).await.map(|_| ())
        } else {
            send_text(&path, w).await
        }
    }

    fn caps_for(&self, selector: &str) -> Option<&str> {
        if selector.trim_start_matches('/') == CAPS_SELECTOR {
            self.caps.as_deref()
        } else {
            None
        }
    }

    /// The menu for `dir`: its gophermap if it has one, otherwise a listing
    /// of its visible entries.
    async fn menu(&self, dir: &Path, url: &Url) -> io::Result<Vec<Dirent>> {
        let base = dir_selector(dir.strip_prefix(&self.root).unwrap_or(Path::new("")));
        let map = dir.join(GOPHERMAP);
        if fs::metadata(&map).await.map(|m| m.is_file()).unwrap_or(false) {
            let text = fs::read_to_string(&map).await?;
            return Ok(parse_gophermap(&text, &base, url));
        }

        let mut names = Vec::new();
        let mut rd = fs::read_dir(dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await?.is_dir();
            names.push((name, entry.path(), is_dir));
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(names
            .into_iter()
            .map(|(name, path, is_dir)| {
                let item_type = if is_dir {
                    ItemType::DIR
                } else {
                    self.item_type_for(&path)
                };
                let selector = format!("{}/{}", base, name);
                let target = Url::new(&url.hostname, url.port, item_type, selector);
                Dirent::link(name, target)
            })
            .collect())
    }
}

#[async_trait]
impl Handler for FsHandler {
    async fn serve_gopher(&self, w: &mut ResponseSink, req: Request) {
        if let Err(e) = self.serve(w, &req.url).await {
            warn!(selector = %req.url.selector, error = %e, "serving failed");
        }
    }
}

/// `/a/b` for a path relative to the root; the root itself is `""`.
fn dir_selector(rel: &Path) -> String {
    let mut out = String::new();
    for part in rel.components() {
        if let Component::Normal(p) = part {
            out.push('/');
            out.push_str(&p.to_string_lossy());
        }
    }
    out
}

fn error_line(message: &str) -> String {
    format!("3{}\t\terror.host\t1\r\n.\r\n", message)
}

/// Send a text file dot-stuffed, with CRLF line endings and a terminator.
async fn send_text(path: &Path, w: &mut ResponseSink) -> io::Result<()> {
    let mut lines = BufReader::new(fs::File::open(path).await?);
    let mut line = Vec::new();
    loop {
        line.clear();
        if lines.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.first() == Some(&b'.') {
            w.write_all(b".").await?;
        }
        w.write_all(&line).await?;
        w.write_all(b"\r\n").await?;
    }
    w.write_all(b".\r\n").await
}

/// Read a gophermap. Lines without a TAB are info text. Entries without a
/// host point back at this server, and relative selectors are taken to be
/// under `base`.
fn parse_gophermap(text: &str, base: &str, url: &Url) -> Vec<Dirent> {
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line == "." {
            break;
        }
        if !line.contains('\t') {
            out.push(Dirent::info(line));
            continue;
        }

        let fields = line.split('\t').count();
        let padded = if fields < 4 {
            format!("{}{}", line, "\t".repeat(4 - fields))
        } else {
            line.to_string()
        };
        let mut ent = match Dirent::parse(&padded) {
            Ok(ent) => ent,
            Err(e) => {
                warn!(line = n + 1, error = %e, "bad gophermap line");
                out.push(Dirent::info(line));
                continue;
            }
        };
        if ent.url.hostname.is_empty() {
            ent.url.hostname = url.hostname.clone();
            ent.url.port = ent.port.unwrap_or(url.port);
            ent.port = Some(ent.url.port);
            let relative = !ent.url.selector.starts_with('/')
                && !ent.url.selector.starts_with("URL:");
            if relative {
                ent.url.selector = format!("{}/{}", base, ent.url.selector);
            }
        }
        out.push(ent);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello\n.hidden dot\nbye\n").unwrap();
        std::fs::write(dir.path().join("logo.gif"), b"GIF89a\0\x01").unwrap();
        std::fs::write(dir.path().join("data.bin"), [0u8, 1, 2, 3]).unwrap();
        std::fs::write(dir.path().join(".secret"), "nope").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/Guide.txt"), "guide\n").unwrap();
        dir
    }

    fn url(selector: &str) -> Url {
        Url::new("gopher.test", 7070, ItemType::DIR, selector)
    }

    async fn serve(handler: &FsHandler, url: Url) -> String {
        let mut out = Vec::new();
        handler.serve(&mut out, &url).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn generated_menu() {
        let dir = site();
        let handler = FsHandler::new(dir.path(), None).unwrap();
        let out = serve(&handler, url("")).await;
        assert_eq!(
            out,
            "9data.bin\t/data.bin\tgopher.test\t7070\r\n\
             1docs\t/docs\tgopher.test\t7070\r\n\
             0hello.txt\t/hello.txt\tgopher.test\t7070\r\n\
             glogo.gif\t/logo.gif\tgopher.test\t7070\r\n\
             .\r\n"
        );

        let out = serve(&handler, url("/docs")).await;
        assert_eq!(
            out,
            "0Guide.txt\t/docs/Guide.txt\tgopher.test\t7070\r\n.\r\n"
        );
    }

    #[tokio::test]
    async fn text_is_dot_stuffed() {
        let dir = site();
        let handler = FsHandler::new(dir.path(), None).unwrap();
        let out = serve(&handler, url("/hello.txt")).await;
        assert_eq!(out, "hello\r\n..hidden dot\r\nbye\r\n.\r\n");
    }

    #[tokio::test]
    async fn binary_is_raw() {
        let dir = site();
        let handler = FsHandler::new(dir.path(), None).unwrap();
        let mut out = Vec::new();
        handler.serve(&mut out, &url("/data.bin")).await.unwrap();
        assert_eq!(out, [0u8, 1, 2, 3]);
    }

    #[tokio::test]
    async fn escapes_are_refused() {
        let dir = site();
        let handler = FsHandler::new(&dir.path().join("docs"), None).unwrap();
        for sel in ["/../hello.txt", "../hello.txt", "/docs/../../etc/passwd"] {
            let out = serve(&handler, url(sel)).await;
            assert!(out.starts_with("3invalid selector\t"), "{}: {:?}", sel, out);
        }
        let out = serve(&handler, url("/missing.txt")).await;
        assert!(out.starts_with("3not found\t"));
    }

    #[tokio::test]
    async fn search_filters_the_menu() {
        let dir = site();
        let handler = FsHandler::new(dir.path(), None).unwrap();
        let mut u = url("");
        u.search = "HELLO".to_string();
        let out = serve(&handler, u).await;
        assert_eq!(out, "0hello.txt\t/hello.txt\tgopher.test\t7070\r\n.\r\n");
    }

    #[tokio::test]
    async fn gophermap_replaces_listing() {
        let dir = site();
        std::fs::write(
            dir.path().join("docs/.gophermap"),
            "Welcome to the docs\n0The guide\tGuide.txt\n1Elsewhere\t/\tother.host\t70\n",
        )
        .unwrap();
        let handler = FsHandler::new(dir.path(), None).unwrap();
        let out = serve(&handler, url("/docs")).await;
        assert_eq!(
            out,
            "iWelcome to the docs\t\tfake\t0\r\n\
             0The guide\t/docs/Guide.txt\tgopher.test\t7070\r\n\
             1Elsewhere\t/\tother.host\t70\r\n\
             .\r\n"
        );
    }

    #[tokio::test]
    async fn caps_fallback() {
        let dir = site();
        let handler = FsHandler::new(dir.path(), None)
            .unwrap()
            .with_caps("CAPS\r\n.\r\n".to_string());
        assert_eq!(serve(&handler, url("caps.txt")).await, "CAPS\r\n.\r\n");
        assert!(serve(&handler, url("/nothing")).await.starts_with('3'));
    }

    #[test]
    fn custom_binary_extensions() {
        let dir = site();
        let handler = FsHandler::new(dir.path(), Some(vec![".TXT".to_string()])).unwrap();
        assert_eq!(handler.item_type_for(Path::new("a.txt")), ItemType::BINARY);
        assert_eq!(handler.item_type_for(Path::new("a.bin")), ItemType::FILE);
        assert_eq!(handler.item_type_for(Path::new("a.gif")), ItemType::GIF);
    }

    #[test]
    fn root_must_be_a_directory() {
        let dir = site();
        assert!(FsHandler::new(&dir.path().join("hello.txt"), None).is_err());
        assert!(FsHandler::new(&dir.path().join("absent"), None).is_err());
    }
}
