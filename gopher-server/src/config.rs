use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use gopher_core::{ServerConfig, ServerInfo};

use crate::Args;

const DEFAULT_BIND: &str = "0.0.0.0:70";

/// The on-disk config. Every field is optional; flags win over the file.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub bind: Option<String>,
    pub host: Option<String>,
    pub root: Option<PathBuf>,
    pub request_size_limit: Option<usize>,
    pub read_timeout_secs: Option<u64>,
    pub read_selector_timeout_secs: Option<u64>,
    pub binary_extensions: Option<Vec<String>>,
    pub info: InfoConfig,
    pub tls: Option<TlsConfig>,
}

/// The `[info]` table. Software name and version always come from this build.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct InfoConfig {
    pub description: String,
    pub geolocation: String,
    pub admin_email: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Flags and file merged.
#[derive(Debug)]
pub struct Settings {
    pub bind: String,
    pub host: Option<String>,
    pub root: PathBuf,
    pub server: ServerConfig,
    pub binary_extensions: Option<Vec<String>>,
    pub info: ServerInfo,
    pub tls: Option<TlsConfig>,
}

impl Settings {
    pub fn resolve(args: &Args, file: Config) -> anyhow::Result<Settings> {
        let defaults = ServerConfig::default();
        let server = ServerConfig {
            request_size_limit: file
                .request_size_limit
                .unwrap_or(defaults.request_size_limit),
            read_timeout: file
                .read_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.read_timeout),
            read_selector_timeout: file
                .read_selector_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.read_selector_timeout),
        };
        if server.request_size_limit == 0 {
            bail!("request_size_limit must be positive");
        }

        let tls = match (&args.tls_cert, &args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None) => file.tls,
            _ => bail!("--tls-cert and --tls-key must be given together"),
        };

        let info = ServerInfo {
            software: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: file.info.description,
            geolocation: file.info.geolocation,
            admin_email: file.info.admin_email,
            ..ServerInfo::default()
        };

        Ok(Settings {
            bind: args
                .bind
                .clone()
                .or(file.bind)
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
            host: args.host.clone().or(file.host),
            root: args
                .root
                .clone()
                .or(file.root)
                .unwrap_or_else(|| PathBuf::from(".")),
            server,
            binary_extensions: file.binary_extensions,
            info,
            tls,
        })
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn file_values_apply() {
        let file: Config = toml::from_str(
            r#"
            bind = "127.0.0.1:7070"
            host = "gopher.example.org"
            root = "/srv/gopher"
            read_timeout_secs = 30
            binary_extensions = ["iso"]

            [info]
            description = "Test hole"
            admin_email = "ops@example.org"

            [tls]
            cert = "server.crt"
            key = "server.key"
            "#,
        )
        .unwrap();
        let args = Args::parse_from(["gopher-server"]);
        let s = Settings::resolve(&args, file).unwrap();

        assert_eq!(s.bind, "127.0.0.1:7070");
        assert_eq!(s.host.as_deref(), Some("gopher.example.org"));
        assert_eq!(s.root, PathBuf::from("/srv/gopher"));
        assert_eq!(s.server.read_timeout, Duration::from_secs(30));
        assert_eq!(s.server.request_size_limit, 4096);
        assert_eq!(s.binary_extensions, Some(vec!["iso".to_string()]));
        assert_eq!(s.info.description, "Test hole");
        assert_eq!(s.info.software, "gopher-server");
        assert_eq!(s.tls.unwrap().cert, PathBuf::from("server.crt"));
    }

    #[test]
    fn flags_override_file() {
        let file: Config = toml::from_str(r#"bind = "127.0.0.1:7070""#).unwrap();
        let args = Args::parse_from([
            "gopher-server",
            "--bind",
            "[::1]:7071",
            "--root",
            "/tmp",
        ]);
        let s = Settings::resolve(&args, file).unwrap();
        assert_eq!(s.bind, "[::1]:7071");
        assert_eq!(s.root, PathBuf::from("/tmp"));
        assert!(s.tls.is_none());
    }

    #[test]
    fn defaults_without_file() {
        let args = Args::parse_from(["gopher-server"]);
        let s = Settings::resolve(&args, Config::default()).unwrap();
        assert_eq!(s.bind, DEFAULT_BIND);
        assert_eq!(s.root, PathBuf::from("."));
        assert_eq!(s.server, ServerConfig::default());
    }

    #[test]
    fn half_a_tls_pair_is_rejected() {
        let args = Args::parse_from(["gopher-server", "--tls-cert", "a.crt"]);
        assert!(Settings::resolve(&args, Config::default()).is_err());
    }

    #[test]
    fn load_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "bind = [").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("server.toml"));
    }
}
