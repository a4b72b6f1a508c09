//! Java RMI registry: JRMI stream-protocol handshake. A ProtocolAck with the
//! echoed endpoint proves an unauthenticated registry.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ProbeContext, ProbeReport};

pub struct RmiConnector;

const PROTOCOL_ACK: u8 = 0x4e;

#[async_trait]
impl Connector for RmiConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Rmi
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to rmi registry at {}", target.addr()));
        let mut stream = match cx.dial(&target.host, target.port).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };

        // "JRMI" + version 2 + stream protocol
        let hello = [0x4a, 0x52, 0x4d, 0x49, 0x00, 0x02, 0x4b];
        if let Err(e) = io::send(&mut stream, &hello, DEFAULT_IO_TIMEOUT).await {
            return ProbeReport::from_error(&e);
        }

        let reply = match io::recv_some(&mut stream, DEFAULT_IO_TIMEOUT).await {
            Ok(r) => r,
            Err(e) => return ProbeReport::from_error(&e),
        };
        if reply.first() != Some(&PROTOCOL_ACK) {
            return ProbeReport::failed("no JRMI protocol ack (not an rmi registry)");
        }
        cx.log("protocol ack received");

        // ack is followed by the endpoint the server sees us as:
        // UTF host (u16 length prefix) + port i32
        let mut endpoint = String::new();
        if reply.len() >= 3 {
            let host_len = ((reply[1] as usize) << 8 | reply[2] as usize).min(reply.len() - 3);
            let host = String::from_utf8_lossy(&reply[3..3 + host_len]).into_owned();
            let port = reply
                .get(3 + host_len..3 + host_len + 4)
                .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0);
            endpoint = format!("{host}:{port}");
        }

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "rmi registry answered stream handshake at {}\n{rule}\nprotocol ack: yes\n",
            target.addr()
        );
        if !endpoint.is_empty() {
            evidence.push_str(&format!("reported client endpoint: {endpoint}\n"));
        }
        evidence.push_str("registry accepts unauthenticated protocol negotiation\n");

        ProbeReport::success("rmi registry access verified", evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn protocol_ack_with_endpoint_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).await;
            let host = b"10.0.0.99";
            let mut ack = vec![PROTOCOL_ACK, 0, host.len() as u8];
            ack.extend_from_slice(host);
            ack.extend_from_slice(&51234i32.to_be_bytes());
            let _ = stream.write_all(&ack).await;
        });

        let target = Target::new(Protocol::Rmi, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = RmiConnector.probe(&target, &cx).await;
        assert!(report.success);
        assert!(report.evidence.contains("10.0.0.99:51234"));
    }

    #[tokio::test]
    async fn non_rmi_reply_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"SSH-2.0-OpenSSH\r\n").await;
        });

        let target = Target::new(Protocol::Rmi, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = RmiConnector.probe(&target, &cx).await;
        assert!(!report.success);
    }
}
