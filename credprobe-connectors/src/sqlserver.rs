//! SQL Server TDS 7.1: PRELOGIN negotiation followed by a LOGIN7 with SQL
//! authentication. Servers that insist on channel encryption are reported,
//! not negotiated with.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{candidates, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct SqlServerConnector;

const DEFAULTS: &[(&str, &str)] = &[("sa", "")];

const PKT_PRELOGIN: u8 = 0x12;
const PKT_LOGIN7: u8 = 0x10;
const PKT_REPLY: u8 = 0x04;

const TOKEN_LOGINACK: u8 = 0xAD;
const TOKEN_ERROR: u8 = 0xAA;

const ENCRYPT_OFF: u8 = 0x00;
const ENCRYPT_NOT_SUP: u8 = 0x02;

async fn send_tds(stream: &mut TcpStream, kind: u8, payload: &[u8]) -> Result<(), ConnectorError> {
    let total = (payload.len() + 8) as u16;
    let mut pkt = vec![kind, 0x01, (total >> 8) as u8, (total & 0xff) as u8, 0, 0, 0, 0];
    pkt.extend_from_slice(payload);
    io::send(stream, &pkt, DEFAULT_IO_TIMEOUT).await
}

async fn recv_tds(stream: &mut TcpStream) -> Result<(u8, Vec<u8>), ConnectorError> {
    let header = io::recv_exact(stream, 8, DEFAULT_IO_TIMEOUT).await?;
    let total = ((header[2] as usize) << 8 | header[3] as usize).max(8);
    let payload = io::recv_exact(stream, total - 8, DEFAULT_IO_TIMEOUT).await?;
    Ok((header[0], payload))
}

fn prelogin_payload() -> Vec<u8> {
    // two options: VERSION (6 bytes) and ENCRYPTION (1 byte)
    let header_len = 2 * 5 + 1;
    let mut p = Vec::new();
    p.push(0x00); // VERSION
    p.extend_from_slice(&(header_len as u16).to_be_bytes());
    p.extend_from_slice(&6u16.to_be_bytes());
    p.push(0x01); // ENCRYPTION
    p.extend_from_slice(&((header_len + 6) as u16).to_be_bytes());
    p.extend_from_slice(&1u16.to_be_bytes());
    p.push(0xFF);
    p.extend_from_slice(&[0x0c, 0x00, 0x10, 0x73, 0x00, 0x00]); // fake client version
    p.push(ENCRYPT_NOT_SUP);
    p
}

fn prelogin_encryption(payload: &[u8]) -> Option<u8> {
    let mut pos = 0;
    while pos + 5 <= payload.len() && payload[pos] != 0xFF {
        let token = payload[pos];
        let offset = (payload[pos + 1] as usize) << 8 | payload[pos + 2] as usize;
        if token == 0x01 {
            return payload.get(offset).copied();
        }
        pos += 5;
    }
    None
}

fn ucs2(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// TDS password obfuscation: swap nibbles, XOR 0xA5, per byte of the UCS-2
/// encoding.
fn scramble_password(password: &str) -> Vec<u8> {
    ucs2(password)
        .into_iter()
        .map(|b| ((b << 4) | (b >> 4)) ^ 0xA5)
        .collect()
}

fn login7_payload(user: &str, password: &str, host: &str) -> Vec<u8> {
    let hostname = ucs2("credprobe");
    let username = ucs2(user);
    let pass = scramble_password(password);
    let appname = ucs2("credprobe");
    let servername = ucs2(host);

    let fixed = 4 + 4 + 4 + 4 + 4 + 4 + 4 + 4 + 4 + 2 * 9 * 2 + 6 + 8;
    // offset/length table covers 9 variable fields plus the 6-byte client id
    let mut var = Vec::new();
    let mut table = Vec::new();
    let mut offset = fixed as u16;
    let mut put = |data: &[u8], table: &mut Vec<u8>, var: &mut Vec<u8>, chars: usize| {
        table.extend_from_slice(&offset.to_le_bytes());
        table.extend_from_slice(&(chars as u16).to_le_bytes());
        var.extend_from_slice(data);
        offset += data.len() as u16;
    };
    put(&hostname, &mut table, &mut var, hostname.len() / 2);
    put(&username, &mut table, &mut var, username.len() / 2);
    put(&pass, &mut table, &mut var, pass.len() / 2);
    put(&appname, &mut table, &mut var, appname.len() / 2);
    put(&servername, &mut table, &mut var, servername.len() / 2);
    put(&[], &mut table, &mut var, 0); // unused
    put(&[], &mut table, &mut var, 0); // library
    put(&[], &mut table, &mut var, 0); // language
    put(&[], &mut table, &mut var, 0); // database

    let mut p = Vec::new();
    p.extend_from_slice(&((fixed + var.len()) as u32).to_le_bytes());
    p.extend_from_slice(&0x7100_0001u32.to_be_bytes()); // TDS 7.1
    p.extend_from_slice(&4096u32.to_le_bytes());
    p.extend_from_slice(&[0u8; 4]); // client version
    p.extend_from_slice(&std::process::id().to_le_bytes());
    p.extend_from_slice(&[0u8; 4]); // connection id
    p.extend_from_slice(&[0xE0, 0x03, 0x00, 0x00]); // option flags, type flags
    p.extend_from_slice(&[0u8; 4]); // timezone
    p.extend_from_slice(&[0u8; 4]); // lcid
    p.extend_from_slice(&table);
    p.extend_from_slice(&[0u8; 6]); // client id
    p.extend_from_slice(&[0u8; 8]); // SSPI + attach db (empty offsets)
    p.extend_from_slice(&var);
    p
}

struct LoginAck {
    program: String,
    version: String,
}

fn read_ucs2(data: &[u8], chars: usize) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .take(chars)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Walk the reply token stream for LOGINACK or ERROR.
fn parse_login_reply(payload: &[u8]) -> Result<LoginAck, ConnectorError> {
    let mut pos = 0;
    while pos < payload.len() {
        let token = payload[pos];
        pos += 1;
        match token {
            TOKEN_LOGINACK => {
                let len = payload.get(pos..pos + 2).map_or(0, |b| {
                    u16::from_le_bytes([b[0], b[1]]) as usize
                });
                let body = payload.get(pos + 2..pos + 2 + len).unwrap_or_default();
                // interface(1) + tds version(4) + progname b-varchar + version(4)
                let name_chars = *body.get(5).unwrap_or(&0) as usize;
                let program = read_ucs2(body.get(6..).unwrap_or_default(), name_chars);
                let vpos = 6 + name_chars * 2;
                let version = match body.get(vpos..vpos + 4) {
                    Some(v) => format!("{}.{}.{}", v[0], v[1], ((v[2] as u16) << 8) | v[3] as u16),
                    None => "unknown".to_string(),
                };
                return Ok(LoginAck { program, version });
            }
            TOKEN_ERROR => {
                let body = payload.get(pos + 2..).unwrap_or_default();
                // number(4) state(1) class(1) then us-varchar message
                let msg_chars = body.get(6..8).map_or(0, |b| {
                    u16::from_le_bytes([b[0], b[1]]) as usize
                });
                let msg = read_ucs2(body.get(8..).unwrap_or_default(), msg_chars);
                return Err(ConnectorError::AuthFailed(msg));
            }
            _ => {
                // skip unknown token by its u16 length when present
                let len = payload.get(pos..pos + 2).map_or(0, |b| {
                    u16::from_le_bytes([b[0], b[1]]) as usize
                });
                pos += 2 + len;
            }
        }
    }
    Err(ConnectorError::Protocol("no LOGINACK in reply".into()))
}

async fn login(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    password: &str,
) -> Result<LoginAck, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;

    send_tds(&mut stream, PKT_PRELOGIN, &prelogin_payload()).await?;
    let (kind, payload) = recv_tds(&mut stream).await?;
    if kind != PKT_REPLY && kind != PKT_PRELOGIN {
        return Err(ConnectorError::Protocol("not a TDS service".into()));
    }
    match prelogin_encryption(&payload) {
        Some(ENCRYPT_OFF) | Some(ENCRYPT_NOT_SUP) | None => {}
        Some(_) => {
            return Err(ConnectorError::UnsupportedAuth(
                "server requires TLS-encrypted login".to_string(),
            ))
        }
    }

    send_tds(&mut stream, PKT_LOGIN7, &login7_payload(user, password, &target.host)).await?;
    let (_, payload) = recv_tds(&mut stream).await?;
    parse_login_reply(&payload)
}

#[async_trait]
impl Connector for SqlServerConnector {
    fn protocol(&self) -> Protocol {
        Protocol::SqlServer
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to sqlserver at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            login(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, ack) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("login accepted ({} {})", ack.program, ack.version));

        let rule = "=".repeat(45);
        let evidence = format!(
            "sqlserver login accepted at {} (user: {})\n{rule}\nserver: {}\nversion: {}\n",
            target.addr(),
            cred.username,
            ack.program,
            ack.version
        );
        ProbeReport::success(
            format!("sqlserver access verified ({} credentials)", cred.label),
            evidence,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tds(kind: u8, payload: &[u8]) -> Vec<u8> {
        let total = (payload.len() + 8) as u16;
        let mut pkt = vec![kind, 0x01, (total >> 8) as u8, (total & 0xff) as u8, 0, 0, 0, 0];
        pkt.extend_from_slice(payload);
        pkt
    }

    fn loginack_payload() -> Vec<u8> {
        let name = ucs2("Microsoft SQL Server");
        let mut body = vec![0x01]; // interface
        body.extend_from_slice(&[0x71, 0x00, 0x00, 0x01]);
        body.push((name.len() / 2) as u8);
        body.extend_from_slice(&name);
        body.extend_from_slice(&[15, 0, 0x08, 0x0B]); // 15.0.2059
        let mut p = vec![TOKEN_LOGINACK];
        p.extend_from_slice(&(body.len() as u16).to_le_bytes());
        p.extend_from_slice(&body);
        p
    }

    fn error_payload(msg: &str) -> Vec<u8> {
        let text = ucs2(msg);
        let mut body = Vec::new();
        body.extend_from_slice(&18456u32.to_le_bytes());
        body.push(1); // state
        body.push(14); // class
        body.extend_from_slice(&((text.len() / 2) as u16).to_le_bytes());
        body.extend_from_slice(&text);
        let mut p = vec![TOKEN_ERROR];
        p.extend_from_slice(&(body.len() as u16).to_le_bytes());
        p.extend_from_slice(&body);
        p
    }

    async fn mock_mssql(listener: TcpListener, accept: bool) {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(p) => p,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await; // prelogin
                let prelogin = {
                    let mut p = vec![0x01, 0x00, 0x06, 0x00, 0x01, 0xFF];
                    p.push(ENCRYPT_NOT_SUP);
                    p
                };
                let _ = stream.write_all(&tds(PKT_REPLY, &prelogin)).await;
                let _ = stream.read(&mut buf).await; // login7
                let reply = if accept {
                    loginack_payload()
                } else {
                    error_payload("Login failed for user 'sa'.")
                };
                let _ = stream.write_all(&tds(PKT_REPLY, &reply)).await;
            });
        }
    }

    #[test]
    fn password_scramble_matches_spec_transform() {
        // 'a' = 0x61 UCS-2 LE -> bytes 61 00; swap+xor: 0x16^0xA5=0xB3, 0x00^0xA5 -> swap(0)=0 ^A5 = 0xA5
        assert_eq!(scramble_password("a"), vec![0xB3, 0xA5]);
    }

    #[tokio::test]
    async fn default_sa_login_reads_loginack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(mock_mssql(listener, true));

        let target = Target::new(Protocol::SqlServer, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = SqlServerConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("Microsoft SQL Server"));
        assert!(report.evidence.contains("15.0"));
    }

    #[tokio::test]
    async fn login_failure_carries_server_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(mock_mssql(listener, false));

        let target = Target::new(Protocol::SqlServer, "127.0.0.1", port)
            .with_credentials(Some("sa".into()), Some("wrong".into()));
        let cx = ProbeContext::new(None);
        let report = SqlServerConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("Login failed"));
    }
}
