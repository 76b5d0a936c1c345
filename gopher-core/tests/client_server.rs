use async_trait::async_trait;
use gopher_core::{
    Client, Dirent, EntryLog, GopherError, Handler, ItemType, LoadTest, MetaHandler, Request,
    Response, ResponseSink, Server, Status, Url,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct TestHandler;

#[async_trait]
impl Handler for TestHandler {
    async fn serve_gopher(&self, w: &mut ResponseSink, req: Request) {
        let url = &req.url;
        match url.selector.as_str() {
            "" => {
                let mut listing = String::new();
                listing.push_str(&Dirent::info("Welcome").to_line());
                let readme = Url::new(&url.hostname, url.port, ItemType::FILE, "/readme");
                listing.push_str(&Dirent::link("Read me", readme).to_line());
                listing.push_str(".\r\n");
                w.write_all(listing.as_bytes()).await.unwrap();
            }
            "/readme" => {
                w.write_all(b"hello\r\n..dotted\r\n.\r\n").await.unwrap();
            }
            "/bin" => {
                let bytes: Vec<u8> = (0..=255).collect();
                w.write_all(&bytes).await.unwrap();
            }
            "/missing" => {
                w.write_all(b"3Not found\terror\terror.host\t1\r\n.\r\n")
                    .await
                    .unwrap();
            }
            "/search" => {
                let line = Dirent::info(format!("you asked for {}", url.search)).to_line();
                w.write_all(line.as_bytes()).await.unwrap();
                w.write_all(b".\r\n").await.unwrap();
            }
            "/echo" => {
                let mut body = BufReader::new(req.body.expect("echo needs a body"));
                let mut line = String::new();
                body.read_line(&mut line).await.unwrap();
                w.write_all(format!("{}view={}\r\n.\r\n", line, req.view).as_bytes())
                    .await
                    .unwrap();
            }
            "/slow" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                w.write_all(b"too late\r\n.\r\n").await.unwrap();
            }
            "/partial" => {
                w.write_all(b"partial\r\n").await.unwrap();
                w.flush().await.unwrap();
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            "/panic" => panic!("handler blew up"),
            _ => {
                w.write_all(b"3No such selector\t\terror.host\t1\r\n.\r\n")
                    .await
                    .unwrap();
            }
        }
    }
}

struct TestMeta;

#[async_trait]
impl MetaHandler for TestMeta {
    async fn serve_gopher_meta(&self, w: &mut ResponseSink, req: Request) {
        let out = format!("+INFO: meta for {}\r\n.\r\n", req.url.selector);
        w.write_all(out.as_bytes()).await.unwrap();
    }
}

async fn start() -> (Arc<Server>, SocketAddr, JoinHandle<Result<(), GopherError>>) {
    let server = Arc::new(Server::new(TestHandler).with_meta_handler(TestMeta));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let s = Arc::clone(&server);
    let task = tokio::spawn(async move { s.serve(listener, None).await });
    (server, addr, task)
}

fn text_url(addr: SocketAddr, selector: &str) -> Url {
    Url::new("127.0.0.1", addr.port(), ItemType::FILE, selector)
}

async fn read_text(client: &Client, url: Url) -> String {
    let mut resp = client.text(Request::new(url)).await.unwrap();
    let mut out = String::new();
    resp.read_to_string(&mut out).await.unwrap();
    resp.close().await.unwrap();
    out
}

#[tokio::test]
async fn directory_listing() {
    let (server, addr, _task) = start().await;
    let client = Client::new();

    let resp = client
        .fetch_url(&Url::root("127.0.0.1", addr.port()))
        .await
        .unwrap();
    let mut dir = resp.into_dir().expect("root is a directory");
    let entries = dir.collect().await;
    dir.close().await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].item_type, ItemType::INFO);
    assert_eq!(entries[0].display, "Welcome");
    assert_eq!(entries[1].display, "Read me");
    assert_eq!(entries[1].url.selector, "/readme");
    assert_eq!(entries[1].url.port, addr.port());
    assert!(entries[1].valid);

    server.close();
}

#[tokio::test]
async fn text_is_unstuffed() {
    let (server, addr, _task) = start().await;
    let out = read_text(&Client::new(), text_url(addr, "/readme")).await;
    assert_eq!(out, "hello\n.dotted\n");
    server.close();
}

#[tokio::test]
async fn binary_passes_every_byte() {
    let (server, addr, _task) = start().await;
    let url = Url::new("127.0.0.1", addr.port(), ItemType::BINARY, "/bin");
    let mut resp = Client::new().fetch_url(&url).await.unwrap();
    let mut out = Vec::new();
    resp.reader().unwrap().read_to_end(&mut out).await.unwrap();
    resp.close().await.unwrap();
    assert_eq!(out, (0..=255).collect::<Vec<u8>>());
    server.close();
}

#[tokio::test]
async fn error_lines_are_intercepted() {
    let (server, addr, _task) = start().await;
    let client = Client::new();

    let err = client
        .text(Request::new(text_url(addr, "/missing")))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::NotFound));
    match err {
        GopherError::Protocol(pe) => {
            assert_eq!(pe.message, "Not found");
            assert!(pe.confidence >= 0.9);
            assert!(pe.raw.starts_with(b"3Not found"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let mut raw = client
        .raw(Request::new(text_url(addr, "/missing")))
        .await
        .unwrap();
    let mut out = Vec::new();
    raw.read_to_end(&mut out).await.unwrap();
    raw.close().await.unwrap();
    assert_eq!(out, b"3Not found\terror\terror.host\t1\r\n.\r\n");

    server.close();
}

#[tokio::test]
async fn search_terms_reach_the_handler() {
    let (server, addr, _task) = start().await;
    let url = Url::new("127.0.0.1", addr.port(), ItemType::SEARCH, "/search");
    let mut dir = Client::new().search(&url, "gophers").await.unwrap();
    let entries = dir.collect().await;
    dir.close().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].display, "you asked for gophers");
    server.close();
}

#[tokio::test]
async fn request_body_and_view() {
    let (server, addr, _task) = start().await;
    let req = Request::new(text_url(addr, "/echo"))
        .with_view("+text/plain")
        .with_body(&b"payload\n"[..]);
    let mut resp = Client::new().text(req).await.unwrap();
    let mut out = String::new();
    resp.read_to_string(&mut out).await.unwrap();
    resp.close().await.unwrap();
    assert_eq!(out, "payload\nview=+text/plain\n");
    server.close();
}

#[tokio::test]
async fn recorder_sees_both_directions() {
    let (server, addr, _task) = start().await;
    let log = EntryLog::new();
    let client = Client::new().with_recorder(log.clone());

    let out = read_text(&client, text_url(addr, "/readme")).await;
    assert_eq!(out, "hello\n.dotted\n");

    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request, b"/readme\t\t0\r\n");
    assert_eq!(entries[0].response, b"hello\r\n..dotted\r\n.\r\n");
    assert_eq!(entries[0].status, Status::Ok);

    let _ = client.text(Request::new(text_url(addr, "/missing"))).await;
    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].status, Status::NotFound);

    server.close();
}

#[tokio::test]
async fn close_is_idempotent() {
    let (server, addr, _task) = start().await;
    let mut resp = Client::new()
        .fetch_url(&text_url(addr, "/readme"))
        .await
        .unwrap();
    assert!(matches!(resp, Response::Text(_)));
    resp.close().await.unwrap();
    resp.close().await.unwrap();
    server.close();
}

#[tokio::test]
async fn slow_server_times_out() {
    let (server, addr, _task) = start().await;
    let client = Client::new().with_timeout(Duration::from_millis(200));
    let err = client
        .text(Request::new(text_url(addr, "/slow")))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);
    server.close();
}

#[tokio::test]
async fn meta_selectors_go_to_the_meta_handler() {
    let (server, addr, _task) = start().await;
    let url = text_url(addr, "/readme").as_meta(gopher_core::MetaType::Item);
    assert!(url.is_meta());
    let out = read_text(&Client::new(), url).await;
    assert_eq!(out, "+INFO: meta for !/readme\n");
    server.close();
}

#[tokio::test]
async fn meta_selectors_without_meta_handler_reach_the_primary() {
    let server = Arc::new(Server::new(TestHandler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let s = Arc::clone(&server);
    tokio::spawn(async move { s.serve(listener, None).await });

    let url = text_url(addr, "/readme").as_meta(gopher_core::MetaType::Item);
    let err = Client::new().text(Request::new(url)).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::NotFound));
    server.close();
}

#[tokio::test]
async fn malformed_request_gets_no_reply() {
    let (server, addr, _task) = start().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"/readme\t\t0\textra\r\n").await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());
    server.close();
}

#[tokio::test]
async fn non_ascii_data_flag_is_rejected_and_forgotten() {
    let (server, addr, _task) = start().await;
    assert_eq!(server.live(), 1);

    for line in [&"/x\t\t\u{e9}\r\n".as_bytes()[..], b"/x\t\t\xff\r\n"] {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(line).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    let mut waited = 0;
    while server.live() > 1 && waited < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(server.live(), 1);

    let out = read_text(&Client::new(), text_url(addr, "/readme")).await;
    assert_eq!(out, "hello\n.dotted\n");
    server.close();
}

#[tokio::test]
async fn close_cuts_off_a_running_handler() {
    let (server, addr, _task) = start().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"/partial\r\n").await.unwrap();

    let mut first = [0u8; 9];
    stream.read_exact(&mut first).await.unwrap();
    assert_eq!(&first, b"partial\r\n");
    assert_eq!(server.live(), 2);

    server.close();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("connection closed promptly")
        .unwrap();
    assert!(rest.is_empty());
    assert_eq!(server.live(), 0);
}

#[tokio::test]
async fn handler_panic_does_not_stop_the_server() {
    let (server, addr, _task) = start().await;
    let client = Client::new();

    let err = client
        .text(Request::new(text_url(addr, "/panic")))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::Empty));

    let out = read_text(&client, text_url(addr, "/readme")).await;
    assert_eq!(out, "hello\n.dotted\n");
    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_test_accounts_for_every_request() {
    let (server, addr, _task) = start().await;
    let report = LoadTest::new(20, 4)
        .run(&Client::new(), &text_url(addr, "/readme"))
        .await;
    assert_eq!(report.attempts, 20);
    assert_eq!(report.successes + report.failures, 20);
    assert_eq!(report.successes, 20);
    assert!(report.mean() <= report.elapsed_total);
    server.close();
}

#[tokio::test]
async fn close_stops_serve() {
    let (server, addr, task) = start().await;
    let _ = read_text(&Client::new(), text_url(addr, "/readme")).await;

    server.close();
    let res = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("serve returns after close")
        .unwrap();
    assert!(matches!(res, Err(GopherError::ServerClosed)));
    assert_eq!(server.live(), 0);

    assert!(TcpStream::connect(addr).await.is_err());
}
