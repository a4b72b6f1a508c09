//! Docker Engine API on an unprotected TCP socket. The probe reads daemon
//! and container inventory; `run_command` drives an exec inside the first
//! running container.

use std::time::Duration;

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use serde_json::{json, Value};

use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct DockerConnector;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

async fn get_json(client: &reqwest::Client, url: &str) -> Result<Value, ConnectorError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ConnectorError::Protocol(format!(
            "http {} for {url}",
            response.status().as_u16()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| ConnectorError::Protocol(e.to_string()))
}

async fn daemon_version(
    client: &reqwest::Client,
    target: &Target,
    cx: &ProbeContext,
) -> Result<(String, Value), ConnectorError> {
    let mut last = ConnectorError::Connection("no scheme answered".into());
    for scheme in ["http", "https"] {
        let base = format!("{scheme}://{}", target.addr());
        match get_json(client, &format!("{base}/version")).await {
            Ok(v) if v["ApiVersion"].is_string() => return Ok((base, v)),
            Ok(_) => last = ConnectorError::Protocol("not a docker daemon".into()),
            Err(e) => {
                cx.log(format!("{scheme} attempt: {e}"));
                last = e;
            }
        }
    }
    Err(last)
}

fn container_line(c: &Value) -> String {
    let id = c["Id"].as_str().unwrap_or_default();
    let id = &id[..id.len().min(12)];
    let name = c["Names"][0].as_str().unwrap_or("?");
    format!(
        "  {id} {} ({}, {})",
        name.trim_start_matches('/'),
        c["Image"].as_str().unwrap_or("?"),
        c["State"].as_str().unwrap_or("?")
    )
}

/// Strip the 8-byte stdout/stderr multiplexing headers from an attached
/// exec stream.
fn demux_exec_output(raw: &[u8]) -> String {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 8 <= raw.len() {
        let size =
            u32::from_be_bytes([raw[pos + 4], raw[pos + 5], raw[pos + 6], raw[pos + 7]]) as usize;
        pos += 8;
        let end = (pos + size).min(raw.len());
        out.extend_from_slice(&raw[pos..end]);
        pos = end;
    }
    if out.is_empty() && !raw.is_empty() {
        // tty mode streams are not multiplexed
        out.extend_from_slice(raw);
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl Connector for DockerConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Docker
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("querying docker daemon at {}", target.addr()));
        let client = match cx.http_client(HTTP_TIMEOUT) {
            Ok(c) => c,
            Err(e) => return ProbeReport::from_error(&e),
        };

        let (base, version) = match daemon_version(&client, target, cx).await {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!(
            "daemon {} answered",
            version["Version"].as_str().unwrap_or("?")
        ));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "docker api exposed without authentication at {base}\n{rule}\nversion: {}\napi version: {}\nos/arch: {}/{}\n",
            version["Version"].as_str().unwrap_or("unknown"),
            version["ApiVersion"].as_str().unwrap_or("unknown"),
            version["Os"].as_str().unwrap_or("?"),
            version["Arch"].as_str().unwrap_or("?"),
        );

        match get_json(&client, &format!("{base}/containers/json?all=true")).await {
            Ok(Value::Array(containers)) => {
                cx.log(format!("{} container(s) listed", containers.len()));
                evidence.push_str(&format!("\ncontainers ({}):\n", containers.len()));
                for c in containers.iter().take(10) {
                    evidence.push_str(&container_line(c));
                    evidence.push('\n');
                }
                if containers.len() > 10 {
                    evidence.push_str(&format!("  ... ({} more)\n", containers.len() - 10));
                }
            }
            Ok(_) => {}
            Err(e) => cx.log(format!("container listing unavailable: {e}")),
        }
        evidence.push_str("\nfull daemon control is possible (create/exec/mount)\n");

        ProbeReport::success("docker unauthenticated access verified", evidence)
    }

    /// Exec inside the first running container.
    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        let client = cx.http_client(HTTP_TIMEOUT)?;
        let (base, _) = daemon_version(&client, target, cx).await?;

        let containers = get_json(&client, &format!("{base}/containers/json")).await?;
        let container = containers
            .as_array()
            .and_then(|list| list.first())
            .and_then(|c| c["Id"].as_str())
            .ok_or_else(|| ConnectorError::Protocol("no running container to exec in".into()))?
            .to_string();
        cx.log(format!("using container {}", &container[..container.len().min(12)]));

        let create = client
            .post(format!("{base}/containers/{container}/exec"))
            .json(&json!({
                "AttachStdout": true,
                "AttachStderr": true,
                "Cmd": ["/bin/sh", "-c", command],
            }))
            .send()
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        if !create.status().is_success() {
            return Err(ConnectorError::Protocol(format!(
                "exec create failed: http {}",
                create.status().as_u16()
            )));
        }
        let exec: Value = create
            .json()
            .await
            .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
        let exec_id = exec["Id"]
            .as_str()
            .ok_or_else(|| ConnectorError::Protocol("exec create returned no id".into()))?;

        let start = client
            .post(format!("{base}/exec/{exec_id}/start"))
            .json(&json!({ "Detach": false, "Tty": false }))
            .send()
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        if !start.status().is_success() {
            return Err(ConnectorError::Protocol(format!(
                "exec start failed: http {}",
                start.status().as_u16()
            )));
        }
        let raw = start
            .bytes()
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        Ok(demux_exec_output(&raw))
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

    #[test]
    fn exec_stream_demux() {
        let mut raw = vec![1u8, 0, 0, 0, 0, 0, 0, 5];
        raw.extend_from_slice(b"uid=0");
        raw.extend_from_slice(&[2u8, 0, 0, 0, 0, 0, 0, 1]);
        raw.extend_from_slice(b"\n");
        assert_eq!(demux_exec_output(&raw), "uid=0\n");
        // tty output passes through untouched
        assert_eq!(demux_exec_output(b"hi"), "hi");
    }

    #[tokio::test]
    async fn daemon_and_containers_become_evidence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            serve_once(
                &listener,
                r#"{"Version":"24.0.7","ApiVersion":"1.43","Os":"linux","Arch":"amd64"}"#,
            )
            .await;
            serve_once(
                &listener,
                r#"[{"Id":"deadbeefcafe0123","Names":["/web"],"Image":"nginx:1.25","State":"running"}]"#,
            )
            .await;
        });

        let target = Target::new(Protocol::Docker, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = DockerConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("24.0.7"));
        assert!(report.evidence.contains("deadbeefcafe web (nginx:1.25, running)"));
    }

    #[tokio::test]
    async fn exec_round_trip_returns_output() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            serve_once(
                &listener,
                r#"{"Version":"24.0.7","ApiVersion":"1.43","Os":"linux","Arch":"amd64"}"#,
            )
            .await;
            serve_once(&listener, r#"[{"Id":"c0ffee","Names":["/db"],"Image":"x","State":"running"}]"#)
                .await;
            serve_once(&listener, r#"{"Id":"exec42"}"#).await;

            // exec start: attached stream with one stdout frame
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let mut body = vec![1u8, 0, 0, 0, 0, 0, 0, 12];
            body.extend_from_slice(b"uid=0(root)\n");
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/vnd.docker.raw-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.write_all(&body).await;
        });

        let target = Target::new(Protocol::Docker, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let out = DockerConnector.run_command(&target, &cx, "id").await.unwrap();
        assert_eq!(out, "uid=0(root)\n");
    }

    #[tokio::test]
    async fn non_docker_http_service_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"hello":"world"}"#;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });

        let target = Target::new(Protocol::Docker, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = DockerConnector.probe(&target, &cx).await;
        assert!(!report.success);
    }
}
