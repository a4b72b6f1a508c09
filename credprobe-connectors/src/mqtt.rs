//! MQTT 3.1.1 CONNECT/CONNACK. Return code 0 is the finding; anything else
//! is reported with the broker's own refusal reason.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{candidates, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct MqttConnector;

// an anonymous connect is the interesting default
const DEFAULTS: &[(&str, &str)] = &[("", "")];

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn connect_packet(client_id: &str, user: &str, pass: &str) -> Vec<u8> {
    let mut flags = 0x02u8; // clean session
    if !user.is_empty() {
        flags |= 0x80;
        if !pass.is_empty() {
            flags |= 0x40;
        }
    }

    let mut body = Vec::new();
    body.extend_from_slice(&4u16.to_be_bytes());
    body.extend_from_slice(b"MQTT");
    body.push(4); // protocol level 3.1.1
    body.push(flags);
    body.extend_from_slice(&60u16.to_be_bytes()); // keepalive

    for field in [Some(client_id), (!user.is_empty()).then_some(user), {
        (!user.is_empty() && !pass.is_empty()).then_some(pass)
    }]
    .into_iter()
    .flatten()
    {
        body.extend_from_slice(&(field.len() as u16).to_be_bytes());
        body.extend_from_slice(field.as_bytes());
    }

    let mut packet = vec![0x10];
    encode_remaining_length(body.len(), &mut packet);
    packet.extend_from_slice(&body);
    packet
}

fn connack_reason(code: u8) -> &'static str {
    match code {
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown refusal code",
    }
}

async fn try_connect(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    pass: &str,
) -> Result<bool, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;
    let packet = connect_packet("credprobe", user, pass);
    io::send(&mut stream, &packet, DEFAULT_IO_TIMEOUT).await?;

    let reply = io::recv_exact(&mut stream, 4, DEFAULT_IO_TIMEOUT).await?;
    if reply[0] != 0x20 || reply[1] != 0x02 {
        return Err(ConnectorError::Protocol("not an MQTT CONNACK".into()));
    }
    match reply[3] {
        0 => Ok(reply[2] & 0x01 != 0), // session present flag
        4 | 5 => Err(ConnectorError::AuthFailed(connack_reason(reply[3]).into())),
        code => Err(ConnectorError::Protocol(connack_reason(code).into())),
    }
}

#[async_trait]
impl Connector for MqttConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to mqtt at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            try_connect(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, session_present) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log("CONNECT accepted");

        let rule = "=".repeat(45);
        let who = if cred.is_anonymous() {
            "anonymous".to_string()
        } else {
            cred.username.clone()
        };
        let evidence = format!(
            "mqtt CONNECT accepted at {} (user: {who})\n{rule}\nreturn code: 0 (accepted)\nsession present: {session_present}\n",
            target.addr()
        );
        ProbeReport::success("mqtt access verified", evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn connect_packet_sets_credential_flags() {
        let anon = connect_packet("c", "", "");
        assert_eq!(anon[0], 0x10);
        // flags byte: protocol name(6) + level(1) => offset 2+6+1 in body
        assert_eq!(anon[9], 0x02);

        let full = connect_packet("c", "u", "p");
        assert_eq!(full[9], 0x02 | 0x80 | 0x40);
    }

    async fn mock_broker(listener: TcpListener, code: u8) {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(p) => p,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(&[0x20, 0x02, 0x00, code]).await;
            });
        }
    }

    #[tokio::test]
    async fn anonymous_connect_is_accepted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(mock_broker(listener, 0));

        let target = Target::new(Protocol::Mqtt, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = MqttConnector.probe(&target, &cx).await;
        assert!(report.success);
        assert!(report.evidence.contains("return code: 0"));
    }

    #[tokio::test]
    async fn not_authorized_fails_with_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(mock_broker(listener, 5));

        let target = Target::new(Protocol::Mqtt, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = MqttConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("not authorized"));
    }
}
