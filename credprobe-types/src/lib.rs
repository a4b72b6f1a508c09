pub mod credential;
pub mod protocol;
pub mod record;
pub mod target;

pub use credential::Credential;
pub use protocol::{Protocol, ProtocolParseError};
pub use record::{ConnectionRecord, ProbeOutcome, ProbeStatus};
pub use target::Target;

/// Markers wrapping an inline base64 PNG inside evidence text, used by
/// presentation layers to detect and render screenshots.
pub const IMAGE_MARKER_OPEN: &str = "[BASE64_IMAGE]";
pub const IMAGE_MARKER_CLOSE: &str = "[/BASE64_IMAGE]";

use serde::{Deserialize, Serialize};

/// SOCKS5 proxy settings, applied uniformly to every probe dial.
///
/// Read at dial time; changing it affects subsequent probes only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// Only "socks5" is supported.
    #[serde(default = "default_proxy_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_proxy_scheme() -> String {
    "socks5".to_string()
}

impl ProxyConfig {
    /// Returns the config as an `Option` suitable for dial sites: `None` when
    /// the proxy is disabled.
    pub fn active(&self) -> Option<&ProxyConfig> {
        if self.enabled { Some(self) } else { None }
    }

    /// Proxy URL in `socks5://[user:pass@]host:port` form (for HTTP clients).
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => format!("socks5://{u}:{p}@{}:{}", self.host, self.port),
            _ => format!("socks5://{}:{}", self.host, self.port),
        }
    }
}
