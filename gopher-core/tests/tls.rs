#![cfg(feature = "tls")]

use async_trait::async_trait;
use gopher_core::{Client, Handler, ItemType, Request, ResponseSink, Server, TlsDialer, Url};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::rustls::{self, Certificate, PrivateKey, RootCertStore};
use tokio_rustls::TlsAcceptor;

struct Hello;

#[async_trait]
impl Handler for Hello {
    async fn serve_gopher(&self, w: &mut ResponseSink, req: Request) {
        let out = format!("secure {}\r\n.\r\n", req.url.selector);
        w.write_all(out.as_bytes()).await.unwrap();
    }
}

fn self_signed() -> (Certificate, PrivateKey) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    (
        Certificate(cert.serialize_der().unwrap()),
        PrivateKey(cert.serialize_private_key_der()),
    )
}

#[tokio::test]
async fn text_over_tls() {
    let (cert, key) = self_signed();

    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();
    let server = Arc::new(Server::new(Hello).with_tls(TlsAcceptor::from(Arc::new(server_config))));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let s = Arc::clone(&server);
    tokio::spawn(async move { s.serve(listener, Some("localhost")).await });

    let mut roots = RootCertStore::empty();
    roots.add(&cert).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let client = Client::new().with_dialer(TlsDialer::new(Arc::new(client_config)));

    let url = Url::new("localhost", port, ItemType::FILE, "/vault");
    let mut resp = client.text(Request::new(url)).await.unwrap();
    let mut out = String::new();
    resp.read_to_string(&mut out).await.unwrap();
    resp.close().await.unwrap();
    assert_eq!(out, "secure /vault\n");

    server.close();
}
