//! On-disk settings, currently just the proxy. Stored as JSON at
//! `~/.credprobe/config.json` (`%APPDATA%\credprobe\config.json` on Windows).

use std::path::{Path, PathBuf};

use anyhow::Context;
use credprobe_types::ProxyConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
}

pub fn default_path() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("credprobe").join("config.json")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".credprobe").join("config.json")
    }
}

/// A missing file is not an error: first run starts from defaults.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn save(path: &Path, config: &Config) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("credprobe-config-missing.json");
        let _ = std::fs::remove_file(&path);
        let config = load(&path).unwrap();
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn save_load_round_trip() {
        let path = std::env::temp_dir().join("credprobe-config-roundtrip.json");
        let config = Config {
            proxy: ProxyConfig {
                enabled: true,
                scheme: "socks5".into(),
                host: "10.0.0.9".into(),
                port: 1080,
                username: Some("probe".into()),
                password: None,
            },
        };
        save(&path, &config).unwrap();
        let loaded = load(&path).unwrap();
        assert!(loaded.proxy.enabled);
        assert_eq!(loaded.proxy.host, "10.0.0.9");
        assert_eq!(loaded.proxy.port, 1080);
        assert_eq!(loaded.proxy.username.as_deref(), Some("probe"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let path = std::env::temp_dir().join("credprobe-config-garbage.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
