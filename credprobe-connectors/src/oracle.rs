//! Oracle TNS listener probing. The probe talks to the listener only: a
//! VERSION command for evidence, then CONNECT attempts down a chain of
//! common service names. Full O5LOGON database authentication is not
//! attempted.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct OracleConnector;

const SERVICE_CHAIN: &[&str] = &["XE", "ORCL", "XEPDB1", "ORCLPDB", "ORCLCDB", "PDBORCL"];

const TNS_CONNECT: u8 = 1;
const TNS_ACCEPT: u8 = 2;
const TNS_REFUSE: u8 = 4;
const TNS_RESEND: u8 = 11;

fn tns_connect_packet(connect_data: &str) -> Vec<u8> {
    let data = connect_data.as_bytes();
    let header_len = 8 + 26; // packet header + connect header
    let total = header_len + data.len();

    let mut p = Vec::with_capacity(total);
    p.extend_from_slice(&(total as u16).to_be_bytes());
    p.extend_from_slice(&[0, 0]); // checksum
    p.push(TNS_CONNECT);
    p.push(0); // flags
    p.extend_from_slice(&[0, 0]); // header checksum

    p.extend_from_slice(&0x0136u16.to_be_bytes()); // version 310
    p.extend_from_slice(&0x012cu16.to_be_bytes()); // compat 300
    p.extend_from_slice(&[0, 0]); // service options
    p.extend_from_slice(&2048u16.to_be_bytes()); // SDU
    p.extend_from_slice(&32767u16.to_be_bytes()); // TDU
    p.extend_from_slice(&[0x4f, 0x98]); // protocol characteristics
    p.extend_from_slice(&[0, 0]); // line turnaround
    p.extend_from_slice(&[0, 1]); // hardware byte order
    p.extend_from_slice(&(data.len() as u16).to_be_bytes());
    p.extend_from_slice(&(header_len as u16).to_be_bytes());
    p.extend_from_slice(&[0u8; 6]); // max recv + flags
    p.extend_from_slice(data);
    p
}

async fn tns_exchange(
    stream: &mut TcpStream,
    connect_data: &str,
) -> Result<(u8, String), ConnectorError> {
    let packet = tns_connect_packet(connect_data);
    io::send(stream, &packet, DEFAULT_IO_TIMEOUT).await?;

    for _ in 0..2 {
        let header = io::recv_exact(stream, 8, DEFAULT_IO_TIMEOUT).await?;
        let total = u16::from_be_bytes([header[0], header[1]]) as usize;
        let kind = header[4];
        let body = if total > 8 {
            io::recv_exact(stream, total - 8, DEFAULT_IO_TIMEOUT).await?
        } else {
            Vec::new()
        };
        if kind == TNS_RESEND {
            io::send(stream, &packet, DEFAULT_IO_TIMEOUT).await?;
            continue;
        }
        let text: String = body
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        return Ok((kind, text));
    }
    Err(ConnectorError::Protocol("listener kept asking for resend".into()))
}

/// A REFUSE whose text names an unknown service means "try the next service
/// name"; anything else is terminal. The vendor text match lives here and
/// nowhere else.
fn is_retryable(refuse_text: &str) -> bool {
    refuse_text.contains("12514")
        || refuse_text.contains("12505")
        || refuse_text.contains("NO_SUCH_SERVICE")
}

fn connect_descriptor(host: &str, port: u16, service: &str) -> String {
    format!(
        "(DESCRIPTION=(CONNECT_DATA=(SERVICE_NAME={service})(CID=(PROGRAM=credprobe)))\
         (ADDRESS=(PROTOCOL=TCP)(HOST={host})(PORT={port})))"
    )
}

#[async_trait]
impl Connector for OracleConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Oracle
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to oracle listener at {}", target.addr()));

        let version_text = {
            let mut stream = match cx.dial(&target.host, target.port).await {
                Ok(s) => s,
                Err(e) => return ProbeReport::from_error(&e),
            };
            match tns_exchange(&mut stream, "(CONNECT_DATA=(COMMAND=version))").await {
                Ok((_, text)) => text,
                Err(e) => return ProbeReport::from_error(&e),
            }
        };
        if !version_text.contains("VSNNUM") && !version_text.contains("Version") {
            return ProbeReport::failed("not an oracle TNS listener");
        }
        cx.log("listener answered version command");

        let services: Vec<String> = match &target.username {
            // username field doubles as an explicit service name override
            Some(name) if !name.is_empty() => vec![name.clone()],
            _ => SERVICE_CHAIN.iter().map(|s| s.to_string()).collect(),
        };

        let mut accepted = None;
        let mut last_refuse = String::new();
        for service in &services {
            cx.log(format!("trying service name {service}"));
            let mut stream = match cx.dial(&target.host, target.port).await {
                Ok(s) => s,
                Err(e) => return ProbeReport::from_error(&e),
            };
            let descriptor = connect_descriptor(&target.host, target.port, service);
            match tns_exchange(&mut stream, &descriptor).await {
                Ok((TNS_ACCEPT, _)) => {
                    accepted = Some(service.clone());
                    break;
                }
                Ok((TNS_REFUSE, text)) if is_retryable(&text) => {
                    last_refuse = text;
                    continue;
                }
                Ok((TNS_REFUSE, text)) => {
                    last_refuse = text;
                    break;
                }
                Ok((kind, _)) => {
                    last_refuse = format!("unexpected TNS packet type {kind}");
                    break;
                }
                Err(e) => return ProbeReport::from_error(&e),
            }
        }

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "oracle TNS listener exposed at {}\n{rule}\nversion response:\n{}\n",
            target.addr(),
            io::clip_lines(&version_text, 6)
        );
        match accepted {
            Some(service) => {
                cx.log(format!("service {service} accepted the connection"));
                evidence.push_str(&format!("\naccepted service name: {service}\n"));
                evidence.push_str("database authentication not attempted\n");
                ProbeReport::success("oracle listener access verified", evidence)
            }
            None => ProbeReport::failed(format!(
                "listener reachable but no service name accepted (last refuse: {})",
                io::clip_lines(&last_refuse, 2)
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tns_reply(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&((body.len() + 8) as u16).to_be_bytes());
        p.extend_from_slice(&[0, 0]);
        p.push(kind);
        p.push(0);
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(body);
        p
    }

    #[test]
    fn refuse_retry_predicate_matches_unknown_service_only() {
        assert!(is_retryable("(ERR=12514)(VSNNUM=0)"));
        assert!(is_retryable("(ERR=12505)"));
        assert!(!is_retryable("(ERR=12520)handler blocked"));
    }

    async fn mock_listener(listener: TcpListener, accepted_service: &'static str) {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(p) => p,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let req = String::from_utf8_lossy(&buf[..n]).to_string();
                let reply = if req.contains("COMMAND=version") {
                    tns_reply(
                        TNS_REFUSE,
                        b"(DESCRIPTION=(VSNNUM=318767104)(ERR=0)) TNSLSNR Version 19.0.0.0.0",
                    )
                } else if req.contains(&format!("SERVICE_NAME={accepted_service}")) {
                    tns_reply(TNS_ACCEPT, &[0u8; 16])
                } else {
                    tns_reply(TNS_REFUSE, b"(ERR=12514)(VSNNUM=318767104)")
                };
                let _ = stream.write_all(&reply).await;
            });
        }
    }

    #[tokio::test]
    async fn service_chain_finds_the_accepted_name() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(mock_listener(listener, "XEPDB1"));

        let target = Target::new(Protocol::Oracle, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = OracleConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("accepted service name: XEPDB1"));
        assert!(report.evidence.contains("VSNNUM"));
    }

    #[tokio::test]
    async fn all_services_refused_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(mock_listener(listener, "NEVERMATCHES"));

        let target = Target::new(Protocol::Oracle, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = OracleConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("no service name accepted"));
    }
}
