use std::sync::Mutex;
use std::time::Duration;

use chrono::Local;
use credprobe_types::ProxyConfig;
use tokio::net::TcpStream;

use crate::ConnectorError;

/// Per-probe environment: the proxy to dial through and the running log.
///
/// Adapters call [`ProbeContext::log`] for every user-visible step; the
/// engine drains the lines into the record when the probe completes.
pub struct ProbeContext {
    proxy: Option<ProxyConfig>,
    log: Mutex<Vec<String>>,
}

impl ProbeContext {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self {
            proxy,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Append a `[HH:MM:SS] message` line to the probe log.
    pub fn log(&self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), message.as_ref());
        if let Ok(mut log) = self.log.lock() {
            log.push(line);
        }
    }

    /// Drain the accumulated log lines.
    pub fn take_log(&self) -> Vec<String> {
        match self.log.lock() {
            Ok(mut log) => std::mem::take(&mut *log),
            Err(_) => Vec::new(),
        }
    }

    /// Dial the target through the configured proxy (or directly).
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ConnectorError> {
        self.dial_timeout(host, port, credprobe_net::DEFAULT_DIAL_TIMEOUT)
            .await
    }

    pub async fn dial_timeout(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<TcpStream, ConnectorError> {
        Ok(credprobe_net::dial(host, port, self.proxy(), timeout).await?)
    }

    /// HTTP client routed through the same proxy as raw dials.
    pub fn http_client(&self, timeout: Duration) -> Result<reqwest::Client, ConnectorError> {
        Ok(credprobe_net::build_http_client(self.proxy(), timeout)?)
    }
}
