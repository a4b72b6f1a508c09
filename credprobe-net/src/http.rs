use std::time::Duration;

use credprobe_types::ProxyConfig;

use crate::NetError;

/// Build the HTTP client used by the REST-style probes (Elasticsearch, etcd,
/// Docker, Kubernetes).
///
/// Certificate validation is disabled: the targets are almost always reached
/// by raw IP with self-signed certificates, and the probe verifies access,
/// not transport identity.
pub fn build_http_client(
    proxy: Option<&ProxyConfig>,
    timeout: Duration,
) -> Result<reqwest::Client, NetError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .user_agent("credprobe/0.3");

    if let Some(p) = proxy {
        let proxy = reqwest::Proxy::all(p.url()).map_err(|e| NetError::Proxy(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| NetError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_without_proxy() {
        assert!(build_http_client(None, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn builds_with_authenticated_proxy() {
        let proxy = ProxyConfig {
            enabled: true,
            scheme: "socks5".into(),
            host: "127.0.0.1".into(),
            port: 1080,
            username: Some("user".into()),
            password: Some("pass".into()),
        };
        assert!(build_http_client(Some(&proxy), Duration::from_secs(5)).is_ok());
    }
}
