//! Redis: RESP2 over a raw socket. Unauthenticated access is the common
//! finding; AUTH is attempted only when the target carries a password.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct RedisConnector;

async fn send_command(stream: &mut TcpStream, parts: &[&str]) -> Result<String, ConnectorError> {
    let mut req = format!("*{}\r\n", parts.len());
    for part in parts {
        req.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
    }
    io::send(stream, req.as_bytes(), DEFAULT_IO_TIMEOUT).await?;
    read_reply(stream).await
}

/// Read one RESP reply and flatten it to text. Errors come back as
/// `Err(Protocol)` so callers can branch on NOAUTH/WRONGPASS.
async fn read_reply(stream: &mut TcpStream) -> Result<String, ConnectorError> {
    let mut buf = io::recv_some(stream, DEFAULT_IO_TIMEOUT).await?;
    if buf.is_empty() {
        return Err(ConnectorError::Connection("server closed connection".into()));
    }
    // bulk replies longer than one read: keep pulling until the announced
    // length is in the buffer
    if buf[0] == b'$' {
        if let Some(header_end) = buf.iter().position(|&b| b == b'\n') {
            let len: i64 = String::from_utf8_lossy(&buf[1..header_end])
                .trim()
                .parse()
                .unwrap_or(-1);
            if len > 0 {
                let want = header_end + 1 + len as usize + 2;
                while buf.len() < want {
                    let more = io::recv_some(stream, DEFAULT_IO_TIMEOUT).await?;
                    if more.is_empty() {
                        break;
                    }
                    buf.extend_from_slice(&more);
                }
            }
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let first = lines.next().unwrap_or_default();
    match first.as_bytes().first() {
        Some(b'+') => Ok(first[1..].to_string()),
        Some(b':') => Ok(first[1..].to_string()),
        Some(b'-') => Err(ConnectorError::Protocol(first[1..].to_string())),
        Some(b'$') => Ok(lines.collect::<Vec<_>>().join("\n")),
        Some(b'*') => Ok(lines.filter(|l| !l.starts_with('$')).collect::<Vec<_>>().join("\n")),
        _ => Ok(text.trim_end().to_string()),
    }
}

async fn open_session(target: &Target, cx: &ProbeContext) -> Result<TcpStream, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;

    if let Some(pass) = &target.password {
        cx.log("sending AUTH");
        let reply = match &target.username {
            Some(user) => send_command(&mut stream, &["AUTH", user, pass]).await,
            None => send_command(&mut stream, &["AUTH", pass]).await,
        };
        reply.map_err(|e| match e {
            ConnectorError::Protocol(msg) => ConnectorError::AuthFailed(msg),
            other => other,
        })?;
    }

    match send_command(&mut stream, &["PING"]).await {
        Ok(reply) if reply.eq_ignore_ascii_case("pong") => Ok(stream),
        Ok(reply) => Err(ConnectorError::Protocol(format!("unexpected PING reply: {reply}"))),
        Err(ConnectorError::Protocol(msg)) if msg.starts_with("NOAUTH") => {
            Err(ConnectorError::AuthFailed("server requires a password".into()))
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Connector for RedisConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Redis
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to redis at {}", target.addr()));
        let mut stream = match open_session(target, cx).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log("PING accepted");

        let rule = "=".repeat(45);
        let mut evidence = format!("redis accessible at {}\n{rule}\n", target.addr());
        if target.password.is_none() {
            evidence.push_str("no authentication required\n");
        }

        if let Ok(info) = send_command(&mut stream, &["INFO", "keyspace"]).await {
            evidence.push_str("\nkeyspace:\n");
            evidence.push_str(&io::clip_lines(info.trim(), 18));
            evidence.push('\n');
        }

        let db_count = match send_command(&mut stream, &["CONFIG", "GET", "databases"]).await {
            Ok(reply) => reply
                .lines()
                .last()
                .and_then(|l| l.trim().parse::<u32>().ok())
                .unwrap_or(16),
            Err(_) => 16,
        };
        evidence.push_str(&format!("\nconfigured databases: {db_count}\n"));

        let mut non_empty = Vec::new();
        for db in 0..db_count.min(16) {
            if send_command(&mut stream, &["SELECT", &db.to_string()]).await.is_err() {
                break;
            }
            if let Ok(size) = send_command(&mut stream, &["DBSIZE"]).await {
                if size.trim() != "0" {
                    non_empty.push(format!("db{db}: {} keys", size.trim()));
                }
            }
        }
        if non_empty.is_empty() {
            evidence.push_str("all databases empty\n");
        } else {
            for line in non_empty.iter().take(10) {
                evidence.push_str(line);
                evidence.push('\n');
            }
        }

        cx.log("evidence collected");
        ProbeReport::success("redis access verified", evidence)
    }

    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        let parts: Vec<&str> = command.split_whitespace().collect();
        if parts.is_empty() {
            return Err(ConnectorError::Protocol("empty command".into()));
        }
        cx.log(format!("executing redis command: {}", parts[0]));
        let mut stream = open_session(target, cx).await?;
        send_command(&mut stream, &parts).await
    }
}
