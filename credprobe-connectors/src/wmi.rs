//! WMI exposure check: a DCE/RPC bind to the endpoint mapper on 135. A
//! bind_ack proves the RPC surface is reachable; no DCOM activation is
//! attempted.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ProbeContext, ProbeReport};

pub struct WmiConnector;

const PDU_BIND: u8 = 11;
const PDU_BIND_ACK: u8 = 12;
const PDU_BIND_NAK: u8 = 13;

// endpoint mapper interface e1af8308-5d1f-11c9-91a4-08002b14a0fa v3.0
const EPM_UUID: [u8; 16] = [
    0x08, 0x83, 0xaf, 0xe1, 0x1f, 0x5d, 0xc9, 0x11, 0x91, 0xa4, 0x08, 0x00, 0x2b, 0x14, 0xa0, 0xfa,
];
// NDR transfer syntax 8a885d04-1ceb-11c9-9fe8-08002b104860 v2
const NDR_UUID: [u8; 16] = [
    0x04, 0x5d, 0x88, 0x8a, 0xeb, 0x1c, 0xc9, 0x11, 0x9f, 0xe8, 0x08, 0x00, 0x2b, 0x10, 0x48, 0x60,
];

fn bind_packet() -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[5, 0]); // rpc version 5.0
    p.push(PDU_BIND);
    p.push(0x03); // first + last frag
    p.extend_from_slice(&[0x10, 0, 0, 0]); // little-endian data representation
    p.extend_from_slice(&0u16.to_le_bytes()); // frag length (patched below)
    p.extend_from_slice(&0u16.to_le_bytes()); // auth length
    p.extend_from_slice(&1u32.to_le_bytes()); // call id
    p.extend_from_slice(&5840u16.to_le_bytes()); // max xmit
    p.extend_from_slice(&5840u16.to_le_bytes()); // max recv
    p.extend_from_slice(&0u32.to_le_bytes()); // assoc group
    p.push(1); // one context
    p.extend_from_slice(&[0, 0, 0]);
    p.extend_from_slice(&0u16.to_le_bytes()); // context id
    p.extend_from_slice(&1u16.to_le_bytes()); // one transfer syntax
    p.extend_from_slice(&EPM_UUID);
    p.extend_from_slice(&3u16.to_le_bytes()); // interface version 3.0
    p.extend_from_slice(&0u16.to_le_bytes());
    p.extend_from_slice(&NDR_UUID);
    p.extend_from_slice(&2u32.to_le_bytes()); // syntax version 2
    let len = p.len() as u16;
    p[8..10].copy_from_slice(&len.to_le_bytes());
    p
}

#[async_trait]
impl Connector for WmiConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Wmi
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to rpc endpoint mapper at {}", target.addr()));
        let mut stream = match cx.dial(&target.host, target.port).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };

        if let Err(e) = io::send(&mut stream, &bind_packet(), DEFAULT_IO_TIMEOUT).await {
            return ProbeReport::from_error(&e);
        }
        let reply = match io::recv_some(&mut stream, DEFAULT_IO_TIMEOUT).await {
            Ok(r) => r,
            Err(e) => return ProbeReport::from_error(&e),
        };
        if reply.len() < 24 || reply[0] != 5 {
            return ProbeReport::failed("not a DCE/RPC service");
        }
        match reply[2] {
            PDU_BIND_ACK => {
                cx.log("bind_ack received");
                let max_xmit = u16::from_le_bytes([reply[16], reply[17]]);
                let assoc = u32::from_le_bytes([reply[20], reply[21], reply[22], reply[23]]);
                let rule = "=".repeat(45);
                let evidence = format!(
                    "DCE/RPC endpoint mapper bind accepted at {}\n{rule}\n\
                     bind_ack: yes\nmax transmit frag: {max_xmit}\nassoc group: {assoc:#010x}\n\
                     transfer syntax: NDR 2.0\nWMI/DCOM surface reachable without authentication\n",
                    target.addr()
                );
                ProbeReport::success("rpc endpoint mapper exposed", evidence)
            }
            PDU_BIND_NAK => ProbeReport::failed("endpoint mapper refused the bind"),
            other => ProbeReport::failed(format!("unexpected rpc pdu type {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn bind_packet_has_patched_frag_length() {
        let p = bind_packet();
        let len = u16::from_le_bytes([p[8], p[9]]);
        assert_eq!(len as usize, p.len());
        assert_eq!(p[2], PDU_BIND);
    }

    #[tokio::test]
    async fn bind_ack_is_a_finding() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let mut ack = vec![5, 0, PDU_BIND_ACK, 0x03, 0x10, 0, 0, 0];
            ack.extend_from_slice(&60u16.to_le_bytes()); // frag len
            ack.extend_from_slice(&0u16.to_le_bytes());
            ack.extend_from_slice(&1u32.to_le_bytes());
            ack.extend_from_slice(&5840u16.to_le_bytes());
            ack.extend_from_slice(&5840u16.to_le_bytes());
            ack.extend_from_slice(&0x1234u32.to_le_bytes());
            ack.resize(60, 0);
            let _ = stream.write_all(&ack).await;
        });

        let target = Target::new(Protocol::Wmi, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = WmiConnector.probe(&target, &cx).await;
        assert!(report.success);
        assert!(report.evidence.contains("bind_ack: yes"));
        assert!(report.evidence.contains("0x00001234"));
    }

    #[tokio::test]
    async fn http_server_is_not_mistaken_for_rpc() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let target = Target::new(Protocol::Wmi, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = WmiConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("not a DCE/RPC service"));
    }
}
