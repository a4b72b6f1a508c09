use std::time::Duration;

use credprobe_types::ProxyConfig;
use tokio::net::TcpStream;
use tracing::debug;

use crate::NetError;

/// Matches the direct-connect timeout the probes were tuned against. Proxied
/// dials get whatever the caller passes, since SOCKS adds a round trip.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `host:port` either directly or through a SOCKS5 proxy.
///
/// `host` may be a hostname; resolution happens on the proxy side when one is
/// configured, so proxied probes work against names only the proxy can see.
pub async fn dial(
    host: &str,
    port: u16,
    proxy: Option<&ProxyConfig>,
    timeout: Duration,
) -> Result<TcpStream, NetError> {
    match proxy {
        None => {
            debug!(host, port, "direct dial");
            tokio::time::timeout(timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| NetError::Timeout)?
                .map_err(|e| NetError::Connection(e.to_string()))
        }
        Some(p) => {
            debug!(host, port, proxy_host = %p.host, "dial via socks5");
            let proxy_host = p.host.clone();
            let proxy_port = p.port;
            let username = p.username.clone();
            let password = p.password.clone();
            let target = (host, port);

            let stream = tokio::time::timeout(timeout, async move {
                match (username, password) {
                    (Some(u), Some(pw)) => {
                        tokio_socks::tcp::Socks5Stream::connect_with_password(
                            (proxy_host.as_str(), proxy_port),
                            target,
                            &u,
                            &pw,
                        )
                        .await
                    }
                    _ => {
                        tokio_socks::tcp::Socks5Stream::connect(
                            (proxy_host.as_str(), proxy_port),
                            target,
                        )
                        .await
                    }
                }
            })
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| NetError::Proxy(e.to_string()))?;

            Ok(stream.into_inner())
        }
    }
}
