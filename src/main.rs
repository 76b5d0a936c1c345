use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;

use config::FurConfig;
use gopher_core::{
    Client, DirResponse, GopherError, ItemType, ItemTypeSet, LoadTest, Request, Response, Url,
};

/// Veronica-2, reachable as `fur search <terms>`.
const SEARCH_ALIAS_URL: &str = "gopher://gopher.floodgap.com/7/v2/vs";

/// Fetch a Gopher URL and write the response to stdout.
///
/// Directories are printed one raw entry line at a time. Text, binary and
/// uuencoded responses are streamed decoded. Protocol errors detected in the
/// response exit with a sysexits code.
#[derive(Parser, Debug)]
#[command(name = "fur", version)]
struct Args {
    /// Gopher URL (e.g. 'gopher://gopher.floodgap.com'). The scheme is
    /// optional. 'search' or 'veronica2' searches Veronica-2.
    url: String,

    /// Search terms; replace the URL's search part
    search: Option<String>,

    /// Print the response bytes exactly as received, with no error detection
    #[arg(long)]
    raw: bool,

    /// Timeout in seconds for dial, send and each read; 0 disables it
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Item types to read raw, as one string (e.g. 'gI')
    #[arg(long)]
    binary_types: Option<String>,

    /// Do not treat error-looking responses as errors
    #[arg(long)]
    no_intercept: bool,

    /// Only print directory entries of these item types
    #[arg(short = 'i', long)]
    include: Option<String>,

    /// Never print directory entries of these item types; wins over --include
    #[arg(short = 'x', long)]
    exclude: Option<String>,

    /// Fetch the URL this many times and report timings instead of printing
    #[arg(long)]
    spam: Option<u64>,

    /// Concurrent workers for --spam
    #[arg(short, long)]
    workers: Option<usize>,

    /// Print the --spam report as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn url(&self) -> Result<Url> {
        let raw = match self.url.as_str() {
            "search" | "veronica2" => SEARCH_ALIAS_URL,
            other => other,
        };
        let mut url = Url::parse(raw).with_context(|| format!("parsing {:?}", raw))?;
        if let Some(search) = &self.search {
            url.search = search.clone();
        }
        Ok(url)
    }

    fn client(&self, config: &FurConfig) -> Client {
        let timeout = self
            .timeout
            .or(config.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(gopher_core::DEFAULT_TIMEOUT);
        let binary = self
            .binary_types
            .as_deref()
            .or(config.binary_types.as_deref())
            .map(|s| ItemTypeSet::from_bytes(s.as_bytes()))
            .unwrap_or_default();
        let intercept = !self.no_intercept && config.intercept_errors.unwrap_or(true);
        Client::new()
            .with_timeout(timeout)
            .with_extra_binary_types(binary)
            .with_intercept_errors(intercept)
    }

    /// The entry filter. Everything passes unless `--include` narrows it.
    fn item_filter(&self) -> ItemTypeSet {
        let mut set = match &self.include {
            Some(inc) => ItemTypeSet::from_bytes(inc.as_bytes()),
            None => (0..=255u8).map(ItemType).collect(),
        };
        if let Some(exc) = &self.exclude {
            for &b in exc.as_bytes() {
                set.remove(ItemType(b));
            }
        }
        set
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("error: {}", e);
    }

    if let Err(err) = run(&args).await {
        eprintln!("error: {:#}", err);
        std::process::exit(exit_code(&err));
    }
}

async fn run(args: &Args) -> Result<()> {
    let config = FurConfig::load();
    let client = args.client(&config);
    let url = args.url()?;

    if let Some(requests) = args.spam {
        let workers = args.workers.or(config.workers).unwrap_or(1);
        return spam(&client, &url, requests, workers, args.json).await;
    }

    let mut out = tokio::io::stdout();
    if args.raw {
        let mut resp = client.raw(Request::new(url)).await?;
        let copied = tokio::io::copy(&mut resp, &mut out).await;
        resp.close().await?;
        copied.context("reading response")?;
    } else {
        let mut resp = client.fetch(Request::new(url)).await?;
        let written = match &mut resp {
            Response::Dir(dir) => print_dir(dir, &args.item_filter(), &mut out).await,
            other => match other.reader() {
                Some(r) => tokio::io::copy(r, &mut out).await.map(|_| ()),
                None => Ok(()),
            },
        };
        let closed = resp.close().await;
        written.context("writing response")?;
        closed?;
    }
    out.flush().await?;
    Ok(())
}

async fn print_dir(
    dir: &mut DirResponse,
    filter: &ItemTypeSet,
    out: &mut (dyn AsyncWrite + Unpin),
) -> std::io::Result<()> {
    while let Some(ent) = dir.next().await {
        if !filter.contains(ent.item_type) {
            continue;
        }
        out.write_all(ent.raw.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    Ok(())
}

async fn spam(client: &Client, url: &Url, requests: u64, workers: usize, json: bool) -> Result<()> {
    info!(%url, requests, workers, "starting load test");
    let report = LoadTest::new(requests, workers).run(client, url).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} requests: {} ok, {} failed; mean {:?}, wall {:?}",
            report.attempts,
            report.successes,
            report.failures,
            report.mean(),
            report.wall
        );
    }
    Ok(())
}

/// Closest `sysexits.h` code for a failure.
fn exit_code(err: &anyhow::Error) -> i32 {
    let Some(e) = err.downcast_ref::<GopherError>() else {
        return 1;
    };
    match e {
        GopherError::Protocol(pe) => pe.status.exit_code(),
        GopherError::InvalidUrl { .. } | GopherError::Unfetchable(_) => 64,
        GopherError::MalformedEntry { .. } | GopherError::BadRequest(_) => 65,
        GopherError::Dial { .. } => 68,
        GopherError::Read(_) | GopherError::Write(_) => 74,
        _ => 1,
    }
}
