//! RabbitMQ AMQP 0-9-1: protocol header, Connection.Start, PLAIN Start-Ok.
//! A Tune frame back means the broker accepted the credentials.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{candidates, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct RabbitMqConnector;

const DEFAULTS: &[(&str, &str)] = &[("guest", "guest")];

const FRAME_METHOD: u8 = 1;
const FRAME_END: u8 = 0xCE;

async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>), ConnectorError> {
    let header = io::recv_exact(stream, 7, DEFAULT_IO_TIMEOUT).await?;
    let size = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
    let mut payload = io::recv_exact(stream, size + 1, DEFAULT_IO_TIMEOUT).await?;
    if payload.pop() != Some(FRAME_END) {
        return Err(ConnectorError::Protocol("missing frame end marker".into()));
    }
    Ok((header[0], payload))
}

async fn write_method(
    stream: &mut TcpStream,
    channel: u16,
    body: &[u8],
) -> Result<(), ConnectorError> {
    let mut frame = vec![FRAME_METHOD];
    frame.extend_from_slice(&channel.to_be_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame.push(FRAME_END);
    io::send(stream, &frame, DEFAULT_IO_TIMEOUT).await
}

fn longstr(payload: &[u8], pos: &mut usize) -> Option<String> {
    let len = u32::from_be_bytes(payload.get(*pos..*pos + 4)?.try_into().ok()?) as usize;
    *pos += 4;
    let s = String::from_utf8_lossy(payload.get(*pos..*pos + len)?).into_owned();
    *pos += len;
    Some(s)
}

/// Pull the string entries out of an AMQP field table. Nested tables are
/// descended into; value types we do not care about stop the walk early,
/// which is fine for evidence purposes.
fn table_strings(table: &[u8], out: &mut Vec<(String, String)>) {
    let mut pos = 0;
    while pos < table.len() {
        let name_len = table[pos] as usize;
        pos += 1;
        let Some(name) = table.get(pos..pos + name_len) else { return };
        let name = String::from_utf8_lossy(name).into_owned();
        pos += name_len;
        let Some(&kind) = table.get(pos) else { return };
        pos += 1;
        match kind {
            b'S' => {
                let Some(value) = longstr(table, &mut pos) else { return };
                out.push((name, value));
            }
            b'F' => {
                let Some(len_bytes) = table.get(pos..pos + 4) else { return };
                let len = u32::from_be_bytes(len_bytes.try_into().unwrap_or_default()) as usize;
                pos += 4;
                let Some(inner) = table.get(pos..pos + len) else { return };
                table_strings(inner, out);
                pos += len;
            }
            b't' => pos += 1,
            b'I' | b'i' => pos += 4,
            b'l' | b'd' => pos += 8,
            _ => return,
        }
    }
}

struct StartInfo {
    version: String,
    properties: Vec<(String, String)>,
    mechanisms: String,
}

async fn handshake(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    pass: &str,
) -> Result<StartInfo, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;
    io::send(&mut stream, b"AMQP\x00\x00\x09\x01", DEFAULT_IO_TIMEOUT).await?;

    let (kind, payload) = read_frame(&mut stream).await?;
    if kind != FRAME_METHOD || payload.get(..4) != Some(&[0, 10, 0, 10]) {
        return Err(ConnectorError::Protocol("expected Connection.Start".into()));
    }
    let version = format!(
        "{}.{}",
        payload.get(4).copied().unwrap_or(0),
        payload.get(5).copied().unwrap_or(0)
    );
    let mut pos = 6;
    let table_len = u32::from_be_bytes(
        payload
            .get(pos..pos + 4)
            .ok_or_else(|| ConnectorError::Protocol("short Start frame".into()))?
            .try_into()
            .unwrap_or_default(),
    ) as usize;
    pos += 4;
    let mut properties = Vec::new();
    if let Some(table) = payload.get(pos..pos + table_len) {
        table_strings(table, &mut properties);
    }
    pos += table_len;
    let mechanisms = longstr(&payload, &mut pos).unwrap_or_default();

    // Start-Ok: empty client table, PLAIN, \0user\0pass, en_US
    let mut body = vec![0, 10, 0, 11];
    body.extend_from_slice(&0u32.to_be_bytes()); // empty client-properties
    body.push(5);
    body.extend_from_slice(b"PLAIN");
    let sasl = format!("\0{user}\0{pass}");
    body.extend_from_slice(&(sasl.len() as u32).to_be_bytes());
    body.extend_from_slice(sasl.as_bytes());
    body.push(5);
    body.extend_from_slice(b"en_US");
    write_method(&mut stream, 0, &body).await?;

    match read_frame(&mut stream).await {
        Ok((FRAME_METHOD, reply)) if reply.get(..4) == Some(&[0, 10, 0, 30]) => Ok(StartInfo {
            version,
            properties,
            mechanisms,
        }),
        Ok((FRAME_METHOD, reply)) if reply.get(..4) == Some(&[0, 10, 0, 50]) => {
            // Connection.Close carries the refusal text
            let mut pos = 6;
            let text = reply
                .get(pos)
                .map(|&len| {
                    pos += 1;
                    String::from_utf8_lossy(reply.get(pos..pos + len as usize).unwrap_or_default())
                        .into_owned()
                })
                .unwrap_or_default();
            Err(ConnectorError::AuthFailed(text))
        }
        Ok(_) => Err(ConnectorError::Protocol("unexpected reply to Start-Ok".into())),
        Err(ConnectorError::Io(_)) | Err(ConnectorError::Connection(_)) => Err(
            ConnectorError::AuthFailed("broker closed the connection".into()),
        ),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Connector for RabbitMqConnector {
    fn protocol(&self) -> Protocol {
        Protocol::RabbitMq
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to rabbitmq at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            handshake(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, info) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("broker accepted {}", cred.username));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "rabbitmq login accepted at {} (user: {})\n{rule}\namqp version: {}\n",
            target.addr(),
            cred.username,
            info.version
        );
        for key in ["product", "version", "platform", "cluster_name"] {
            if let Some((_, v)) = info.properties.iter().find(|(k, _)| k == key) {
                evidence.push_str(&format!("{key}: {v}\n"));
            }
        }
        if !info.mechanisms.is_empty() {
            evidence.push_str(&format!("mechanisms: {}\n", info.mechanisms));
        }

        ProbeReport::success(
            format!("rabbitmq access verified ({} credentials)", cred.label),
            evidence,
        )
    }
}
