//! PostgreSQL wire protocol 3.0. Cleartext and MD5 password auth are
//! implemented; SCRAM-SHA-256 is reported as an unsupported scheme rather
//! than guessed at.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use md5::Md5;
use sha1::Digest;
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{candidates, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct PostgresConnector;

const DEFAULTS: &[(&str, &str)] = &[("postgres", "")];

async fn read_message(stream: &mut TcpStream) -> Result<(u8, Vec<u8>), ConnectorError> {
    let header = io::recv_exact(stream, 5, DEFAULT_IO_TIMEOUT).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len < 4 {
        return Err(ConnectorError::Protocol("bad message length".into()));
    }
    let body = io::recv_exact(stream, len - 4, DEFAULT_IO_TIMEOUT).await?;
    Ok((header[0], body))
}

async fn write_message(
    stream: &mut TcpStream,
    kind: Option<u8>,
    body: &[u8],
) -> Result<(), ConnectorError> {
    let mut msg = Vec::with_capacity(body.len() + 5);
    if let Some(k) = kind {
        msg.push(k);
    }
    msg.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    msg.extend_from_slice(body);
    io::send(stream, &msg, DEFAULT_IO_TIMEOUT).await
}

/// `M` field of an ErrorResponse.
fn error_text(body: &[u8]) -> String {
    let mut pos = 0;
    while pos < body.len() && body[pos] != 0 {
        let tag = body[pos];
        pos += 1;
        let start = pos;
        while pos < body.len() && body[pos] != 0 {
            pos += 1;
        }
        if tag == b'M' {
            return String::from_utf8_lossy(&body[start..pos]).into_owned();
        }
        pos += 1;
    }
    "server error".to_string()
}

fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut inner = Md5::new();
    inner.update(password.as_bytes());
    inner.update(user.as_bytes());
    let inner_hex = hex(&inner.finalize());

    let mut outer = Md5::new();
    outer.update(inner_hex.as_bytes());
    outer.update(salt);
    format!("md5{}", hex(&outer.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn authenticate(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    password: &str,
) -> Result<TcpStream, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;

    let mut startup = Vec::new();
    startup.extend_from_slice(&196608u32.to_be_bytes()); // protocol 3.0
    for (k, v) in [("user", user), ("database", "postgres")] {
        startup.extend_from_slice(k.as_bytes());
        startup.push(0);
        startup.extend_from_slice(v.as_bytes());
        startup.push(0);
    }
    startup.push(0);
    write_message(&mut stream, None, &startup).await?;

    loop {
        let (kind, body) = read_message(&mut stream).await?;
        match kind {
            b'R' => {
                if body.len() < 4 {
                    return Err(ConnectorError::Protocol("short authentication message".into()));
                }
                let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                match code {
                    0 => {} // AuthenticationOk
                    3 => {
                        let mut p = password.as_bytes().to_vec();
                        p.push(0);
                        write_message(&mut stream, Some(b'p'), &p).await?;
                    }
                    5 => {
                        let salt = body.get(4..8).ok_or_else(|| {
                            ConnectorError::Protocol("md5 request without salt".into())
                        })?;
                        let mut p = md5_password(user, password, salt).into_bytes();
                        p.push(0);
                        write_message(&mut stream, Some(b'p'), &p).await?;
                    }
                    10 => {
                        return Err(ConnectorError::UnsupportedAuth(
                            "SCRAM-SHA-256".to_string(),
                        ))
                    }
                    other => {
                        return Err(ConnectorError::UnsupportedAuth(format!(
                            "authentication code {other}"
                        )))
                    }
                }
            }
            b'E' => return Err(ConnectorError::AuthFailed(error_text(&body))),
            b'Z' => return Ok(stream), // ReadyForQuery
            b'K' | b'S' | b'N' => {}   // BackendKeyData, ParameterStatus, Notice
            other => {
                return Err(ConnectorError::Protocol(format!(
                    "unexpected message {:?}",
                    other as char
                )))
            }
        }
    }
}

async fn list_databases(stream: &mut TcpStream) -> Result<Vec<String>, ConnectorError> {
    let mut q = b"SELECT datname FROM pg_database".to_vec();
    q.push(0);
    write_message(stream, Some(b'Q'), &q).await?;

    let mut names = Vec::new();
    loop {
        let (kind, body) = read_message(stream).await?;
        match kind {
            b'D' => {
                // column count u16, then per column: i32 length + bytes
                if body.len() > 6 {
                    let len = i32::from_be_bytes([body[2], body[3], body[4], body[5]]);
                    if len > 0 {
                        let end = 6 + len as usize;
                        if end <= body.len() {
                            names.push(String::from_utf8_lossy(&body[6..end]).into_owned());
                        }
                    }
                }
            }
            b'E' => return Err(ConnectorError::Protocol(error_text(&body))),
            b'Z' => break,
            _ => {} // RowDescription, CommandComplete
        }
        if names.len() > 64 {
            break;
        }
    }
    Ok(names)
}

#[async_trait]
impl Connector for PostgresConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Postgres
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to postgresql at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            authenticate(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, mut stream) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("authenticated as {}", cred.username));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "postgresql login accepted at {} (user: {})\n{rule}\n",
            target.addr(),
            cred.username
        );
        match list_databases(&mut stream).await {
            Ok(names) => {
                evidence.push_str(&format!("databases ({}):\n", names.len()));
                for name in names.iter().take(10) {
                    evidence.push_str(&format!("  {name}\n"));
                }
                if names.len() > 10 {
                    evidence.push_str(&format!("  ... ({} more)\n", names.len() - 10));
                }
            }
            Err(e) => cx.log(format!("database listing failed: {e}")),
        }

        ProbeReport::success(
            format!("postgresql access verified ({} credentials)", cred.label),
            evidence,
        )
    }
}
