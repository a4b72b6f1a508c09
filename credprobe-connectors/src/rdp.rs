//! RDP security posture via X.224 connection negotiation. No credential is
//! spent here: the negotiation response alone says whether the server will
//! take a plain connection, demands TLS, or enforces NLA.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ProbeContext, ProbeReport};

pub struct RdpConnector;

const PROTOCOL_RDP: u32 = 0x0000_0000;
const PROTOCOL_SSL: u32 = 0x0000_0001;
const PROTOCOL_HYBRID: u32 = 0x0000_0002;
const PROTOCOL_HYBRID_EX: u32 = 0x0000_0008;

const TYPE_NEG_RSP: u8 = 0x02;
const TYPE_NEG_FAILURE: u8 = 0x03;

fn connection_request() -> Vec<u8> {
    let cookie = b"Cookie: mstshash=probe\r\n";

    // x.224 connection request payload
    let mut x224 = vec![0xE0, 0, 0, 0, 0, 0];
    x224.extend_from_slice(cookie);
    // RDP_NEG_REQ asking for everything we can name
    x224.push(0x01);
    x224.push(0x00);
    x224.extend_from_slice(&8u16.to_le_bytes());
    x224.extend_from_slice(
        &(PROTOCOL_SSL | PROTOCOL_HYBRID | PROTOCOL_HYBRID_EX).to_le_bytes(),
    );

    let mut tpkt = vec![3, 0];
    let total = 4 + 1 + x224.len();
    tpkt.extend_from_slice(&(total as u16).to_be_bytes());
    tpkt.push(x224.len() as u8); // length indicator
    tpkt.extend_from_slice(&x224);
    tpkt
}

fn protocol_name(selected: u32) -> &'static str {
    match selected {
        PROTOCOL_RDP => "standard RDP security (no TLS)",
        PROTOCOL_SSL => "TLS",
        PROTOCOL_HYBRID => "CredSSP (NLA)",
        PROTOCOL_HYBRID_EX => "CredSSP with early user auth (NLA)",
        _ => "unknown protocol",
    }
}

fn failure_reason(code: u32) -> &'static str {
    match code {
        1 => "server requires TLS",
        2 => "server does not allow TLS",
        3 => "no server certificate installed",
        4 => "inconsistent negotiation flags",
        5 => "server requires NLA (CredSSP)",
        6 => "server requires TLS with user authentication",
        _ => "unspecified negotiation failure",
    }
}

#[async_trait]
impl Connector for RdpConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Rdp
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to rdp at {}", target.addr()));
        let mut stream = match cx.dial(&target.host, target.port).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };

        if let Err(e) = io::send(&mut stream, &connection_request(), DEFAULT_IO_TIMEOUT).await {
            return ProbeReport::from_error(&e);
        }
        let reply = match io::recv_some(&mut stream, DEFAULT_IO_TIMEOUT).await {
            Ok(r) => r,
            Err(e) => return ProbeReport::from_error(&e),
        };
        if reply.len() < 7 || reply[0] != 3 {
            return ProbeReport::failed("not an rdp service (no TPKT reply)");
        }
        // x.224 connection confirm
        if reply[5] & 0xF0 != 0xD0 {
            return ProbeReport::failed("x.224 connection refused");
        }
        cx.log("x.224 connection confirmed");

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "rdp service confirmed at {}\n{rule}\nx.224 connection: accepted\n",
            target.addr()
        );

        // neg response/failure rides at the end of the confirm, 8 bytes
        let mut nla_enforced = false;
        if reply.len() >= 11 + 8 {
            let neg = &reply[11..];
            let value = u32::from_le_bytes([neg[4], neg[5], neg[6], neg[7]]);
            match neg[0] {
                TYPE_NEG_RSP => {
                    cx.log(format!("server selected {}", protocol_name(value)));
                    nla_enforced = value == PROTOCOL_HYBRID || value == PROTOCOL_HYBRID_EX;
                    evidence.push_str(&format!("selected security: {}\n", protocol_name(value)));
                    if value == PROTOCOL_RDP {
                        evidence.push_str(
                            "standard RDP security accepted: traffic is not TLS-protected\n",
                        );
                    }
                }
                TYPE_NEG_FAILURE => {
                    cx.log(format!("negotiation failure: {}", failure_reason(value)));
                    nla_enforced = value == 5;
                    evidence.push_str(&format!("negotiation failure: {}\n", failure_reason(value)));
                }
                _ => evidence.push_str("no negotiation payload in connection confirm\n"),
            }
        } else {
            // pre-6.0 servers answer with a bare confirm
            evidence.push_str("legacy server: standard RDP security only\n");
        }
        evidence.push_str(&format!(
            "network level authentication: {}\n",
            if nla_enforced {
                "enforced"
            } else {
                "not enforced (pre-auth screen reachable)"
            }
        ));

        ProbeReport::success("rdp service posture captured", evidence)
    }
}
