//! Kubernetes API server probe. Anonymous requests by default; a bearer
//! token can be supplied through the target's password field.

use std::time::Duration;

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use serde_json::Value;

use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct KubernetesConnector;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

async fn get_json(
    client: &reqwest::Client,
    target: &Target,
    url: &str,
) -> Result<Value, ConnectorError> {
    let mut request = client.get(url);
    if let Some(token) = &target.password {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;
    match response.status().as_u16() {
        200 => response
            .json()
            .await
            .map_err(|e| ConnectorError::Protocol(e.to_string())),
        401 => Err(ConnectorError::AuthFailed(
            "api server rejected the request (401)".into(),
        )),
        403 => Err(ConnectorError::AuthFailed(format!(
            "rbac denied access to {url} (403)"
        ))),
        other => Err(ConnectorError::Protocol(format!("http {other} for {url}"))),
    }
}

async fn api_version(
    client: &reqwest::Client,
    target: &Target,
    cx: &ProbeContext,
) -> Result<(String, Value), ConnectorError> {
    let mut last = ConnectorError::Connection("no scheme answered".into());
    // api servers are https in practice; plain http only on legacy 8080
    for scheme in ["https", "http"] {
        let base = format!("{scheme}://{}", target.addr());
        match get_json(client, target, &format!("{base}/version")).await {
            Ok(v) if v["gitVersion"].is_string() => return Ok((base, v)),
            Ok(_) => last = ConnectorError::Protocol("not a kubernetes api server".into()),
            Err(e @ ConnectorError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                cx.log(format!("{scheme} attempt: {e}"));
                last = e;
            }
        }
    }
    Err(last)
}

#[async_trait]
impl Connector for KubernetesConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Kubernetes
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("querying kubernetes api at {}", target.addr()));
        let client = match cx.http_client(HTTP_TIMEOUT) {
            Ok(c) => c,
            Err(e) => return ProbeReport::from_error(&e),
        };

        let (base, version) = match api_version(&client, target, cx).await {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        let how = if target.password.is_some() {
            "supplied bearer token"
        } else {
            "anonymous access"
        };
        cx.log(format!(
            "api server {} answered ({how})",
            version["gitVersion"].as_str().unwrap_or("?")
        ));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "kubernetes api reachable at {base} ({how})\n{rule}\nversion: {}\nplatform: {}\n",
            version["gitVersion"].as_str().unwrap_or("unknown"),
            version["platform"].as_str().unwrap_or("unknown"),
        );

        // namespace listing is the real privilege test
        match get_json(&client, target, &format!("{base}/api/v1/namespaces?limit=10")).await {
            Ok(doc) => {
                let names: Vec<&str> = doc["items"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i["metadata"]["name"].as_str())
                            .collect()
                    })
                    .unwrap_or_default();
                cx.log(format!("{} namespace(s) listed", names.len()));
                evidence.push_str(&format!("\nnamespaces ({} shown):\n", names.len()));
                for name in &names {
                    evidence.push_str(&format!("  {name}\n"));
                }
                evidence.push_str("\ncluster-level read access confirmed\n");
            }
            Err(e) => {
                cx.log(format!("namespace listing denied: {e}"));
                evidence.push_str(&format!(
                    "\nnamespace listing denied ({e})\nversion endpoint is exposed but rbac limits reads\n"
                ));
            }
        }

        ProbeReport::success(format!("kubernetes access verified ({how})"), evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(listener: &TcpListener, status: &str, body: &str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        let reply = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(reply.as_bytes()).await;
        request
    }

    #[tokio::test]
    async fn anonymous_cluster_lists_namespaces() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            serve_once(
                &listener,
                "200 OK",
                r#"{"gitVersion":"v1.29.2","platform":"linux/amd64"}"#,
            )
            .await;
            serve_once(
                &listener,
                "200 OK",
                r#"{"items":[{"metadata":{"name":"default"}},{"metadata":{"name":"kube-system"}}]}"#,
            )
            .await;
        });

        let target = Target::new(Protocol::Kubernetes, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = KubernetesConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.message.contains("anonymous access"));
        assert!(report.evidence.contains("v1.29.2"));
        assert!(report.evidence.contains("kube-system"));
    }

    #[tokio::test]
    async fn bearer_token_is_sent_and_rbac_denial_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let req = serve_once(
                &listener,
                "200 OK",
                r#"{"gitVersion":"v1.28.0","platform":"linux/amd64"}"#,
            )
            .await;
            let _ = tx.send(req);
            serve_once(&listener, "403 Forbidden", r#"{"kind":"Status"}"#).await;
        });

        let target = Target::new(Protocol::Kubernetes, "127.0.0.1", port)
            .with_credentials(None, Some("sa-token-abc".into()));
        let cx = ProbeContext::new(None);
        let report = KubernetesConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.message.contains("bearer token"));
        assert!(report.evidence.contains("rbac limits reads"));

        let request = rx.await.unwrap();
        assert!(request.contains("Bearer sa-token-abc"));
    }

    #[tokio::test]
    async fn unauthorized_api_server_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                serve_once(&listener, "401 Unauthorized", r#"{"kind":"Status"}"#).await;
            }
        });

        let target = Target::new(Protocol::Kubernetes, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = KubernetesConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("401"));
    }
}
