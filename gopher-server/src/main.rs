use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod caps;
mod config;
mod fs;
mod tls;

use gopher_core::{GopherError, Server};

use crate::caps::CapsHandler;
use crate::config::{Config, Settings};
use crate::fs::FsHandler;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on [default: 0.0.0.0:70]
    #[arg(short, long)]
    bind: Option<String>,

    /// Hostname (and port) written into menus, e.g. `gopher.example.org:70`
    #[arg(long)]
    host: Option<String>,

    /// Directory to serve [default: .]
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    tls_cert: Option<PathBuf>,

    #[arg(long)]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let file = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            config::load_config(path)?
        }
        None => Config::default(),
    };
    let settings = Settings::resolve(&args, file)?;

    let handler = FsHandler::new(&settings.root, settings.binary_extensions.clone())
        .with_context(|| format!("serving {}", settings.root.display()))?
        .with_caps(caps::render(&settings.info));
    info!(root = %handler.root().display(), "Serving directory");

    let mut server = Server::new(handler)
        .with_meta_handler(CapsHandler::new(&settings.info))
        .with_config(settings.server.clone())
        .with_info(settings.info.clone());

    if let Some(tls) = &settings.tls {
        let config = tls::make_server_config(&tls.cert, &tls.key)
            .with_context(|| format!("loading TLS from {}", tls.cert.display()))?;
        server = server.with_tls(TlsAcceptor::from(config));
        info!("TLS enabled");
    }

    let server = Arc::new(server);
    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            stopper.close();
        }
    });

    match server
        .listen_and_serve(&settings.bind, settings.host.as_deref())
        .await
    {
        Ok(()) | Err(GopherError::ServerClosed) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("serving on {}", settings.bind)),
    }
}
