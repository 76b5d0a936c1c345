use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

/// Defaults read from `~/.fur.toml`. Flags win.
#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct FurConfig {
    pub timeout_secs: Option<u64>,
    /// Item types to always read raw, as one string (e.g. `"gI"`).
    pub binary_types: Option<String>,
    pub intercept_errors: Option<bool>,
    pub workers: Option<usize>,
}

impl FurConfig {
    pub fn load() -> Self {
        for path in Self::candidate_paths() {
            if let Ok(content) = std::fs::read_to_string(&path) {
                match toml::from_str::<FurConfig>(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to parse config");
                    }
                }
            }
        }
        Self::default()
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let home = match std::env::var("HOME") {
            Ok(h) => PathBuf::from(h),
            Err(_) => return Vec::new(),
        };

        vec![home.join(".fur.toml")]
    }
}
