//! etcd over its HTTP surfaces: /version for identification, then the v3
//! grpc-gateway range endpoint (falling back to the v2 keys API) to prove
//! the keyspace is readable.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use credprobe_types::{Protocol, Target};
use serde_json::{json, Value};

use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct EtcdConnector;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

async fn version_document(
    client: &reqwest::Client,
    target: &Target,
    cx: &ProbeContext,
) -> Result<(String, Value), ConnectorError> {
    let mut last = ConnectorError::Connection("no scheme answered".into());
    for scheme in ["http", "https"] {
        let base = format!("{scheme}://{}", target.addr());
        let result = async {
            let response = client
                .get(format!("{base}/version"))
                .send()
                .await
                .map_err(|e| ConnectorError::Connection(e.to_string()))?;
            if !response.status().is_success() {
                return Err(ConnectorError::Protocol(format!(
                    "http {} for /version",
                    response.status().as_u16()
                )));
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| ConnectorError::Protocol(e.to_string()))
        }
        .await;
        match result {
            Ok(v) => return Ok((base, v)),
            Err(e) => {
                cx.log(format!("{scheme} attempt: {e}"));
                last = e;
            }
        }
    }
    Err(last)
}

struct Keyspace {
    api: &'static str,
    total: u64,
    keys: Vec<String>,
}

/// v3 range over the whole keyspace, keys only, bounded.
async fn range_v3(client: &reqwest::Client, base: &str) -> Result<Keyspace, ConnectorError> {
    let body = json!({
        "key": BASE64.encode(b"\0"),
        "range_end": BASE64.encode(b"\0"),
        "keys_only": true,
        "limit": 10,
    });
    let response = client
        .post(format!("{base}/v3/kv/range"))
        .json(&body)
        .send()
        .await
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;
    match response.status().as_u16() {
        200 => {}
        400 | 401 => {
            return Err(ConnectorError::AuthFailed(
                "v3 range rejected (auth enabled)".into(),
            ))
        }
        other => return Err(ConnectorError::Protocol(format!("http {other} for v3 range"))),
    }
    let doc: Value = response
        .json()
        .await
        .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
    let keys = doc["kvs"]
        .as_array()
        .map(|kvs| {
            kvs.iter()
                .filter_map(|kv| kv["key"].as_str())
                .filter_map(|k| BASE64.decode(k).ok())
                .map(|k| String::from_utf8_lossy(&k).into_owned())
                .collect()
        })
        .unwrap_or_default();
    Ok(Keyspace {
        api: "v3 (grpc gateway)",
        // the gateway encodes int64 as a json string
        total: doc["count"]
            .as_str()
            .and_then(|c| c.parse().ok())
            .or_else(|| doc["count"].as_u64())
            .unwrap_or(0),
        keys,
    })
}

async fn keys_v2(client: &reqwest::Client, base: &str) -> Result<Keyspace, ConnectorError> {
    let response = client
        .get(format!("{base}/v2/keys/"))
        .send()
        .await
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;
    if response.status().as_u16() == 401 {
        return Err(ConnectorError::AuthFailed("v2 keys rejected".into()));
    }
    if !response.status().is_success() {
        return Err(ConnectorError::Protocol(format!(
            "http {} for /v2/keys",
            response.status().as_u16()
        )));
    }
    let doc: Value = response
        .json()
        .await
        .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
    let keys: Vec<String> = doc["node"]["nodes"]
        .as_array()
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| n["key"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    Ok(Keyspace {
        api: "v2",
        total: keys.len() as u64,
        keys,
    })
}

#[async_trait]
impl Connector for EtcdConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Etcd
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("querying etcd at {}", target.addr()));
        let client = match cx.http_client(HTTP_TIMEOUT) {
            Ok(c) => c,
            Err(e) => return ProbeReport::from_error(&e),
        };

        let (base, version) = match version_document(&client, target, cx).await {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        let server_version = version["etcdserver"].as_str().unwrap_or_default();
        if server_version.is_empty() {
            return ProbeReport::failed("service answered but is not etcd");
        }
        cx.log(format!("etcdserver {server_version} answered"));

        let keyspace = match range_v3(&client, &base).await {
            Ok(k) => Ok(k),
            Err(e) => {
                cx.log(format!("v3 range: {e}, trying v2"));
                keys_v2(&client, &base).await
            }
        };
        let keyspace = match keyspace {
            Ok(k) => k,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("keyspace readable via {} api", keyspace.api));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "etcd keyspace readable without authentication at {base}\n{rule}\nserver version: {server_version}\ncluster version: {}\napi: {}\nkey count: {}\n",
            version["etcdcluster"].as_str().unwrap_or("unknown"),
            keyspace.api,
            keyspace.total,
        );
        if !keyspace.keys.is_empty() {
            evidence.push_str("\nkeys:\n");
            for key in keyspace.keys.iter().take(10) {
                evidence.push_str(&format!("  {key}\n"));
            }
            if keyspace.total as usize > keyspace.keys.len() {
                evidence.push_str(&format!(
                    "  ... ({} more)\n",
                    keyspace.total as usize - keyspace.keys.len()
                ));
            }
        }
        ProbeReport::success("etcd unauthenticated access verified", evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(listener: &TcpListener, body: &str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await;
        let reply = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(reply.as_bytes()).await;
    }

    #[tokio::test]
    async fn v3_keyspace_becomes_evidence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let key = BASE64.encode(b"/config/database/password");
        tokio::spawn(async move {
            serve_once(
                &listener,
                r#"{"etcdserver":"3.5.12","etcdcluster":"3.5.0"}"#,
            )
            .await;
            let range = format!(r#"{{"count":"23","kvs":[{{"key":"{key}"}}]}}"#);
            serve_once(&listener, &range).await;
        });

        let target = Target::new(Protocol::Etcd, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = EtcdConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("3.5.12"));
        assert!(report.evidence.contains("/config/database/password"));
        assert!(report.evidence.contains("key count: 23"));
    }

    #[tokio::test]
    async fn v2_fallback_when_v3_is_absent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            serve_once(&listener, r#"{"etcdserver":"2.3.8","etcdcluster":"2.3.0"}"#).await;
            // v3 gateway missing
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
            serve_once(
                &listener,
                r#"{"node":{"nodes":[{"key":"/registry"},{"key":"/flags"}]}}"#,
            )
            .await;
        });

        let target = Target::new(Protocol::Etcd, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = EtcdConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("api: v2"));
        assert!(report.evidence.contains("/registry"));
    }

    #[tokio::test]
    async fn non_etcd_service_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            serve_once(&listener, r#"{"version":"1.0"}"#).await;
        });

        let target = Target::new(Protocol::Etcd, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = EtcdConnector.probe(&target, &cx).await;
        assert!(!report.success);
    }
}
