//! FTP control channel with a PASV data connection for the listing.
//! Anonymous login is the default finding.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{candidates, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct FtpConnector;

const DEFAULTS: &[(&str, &str)] = &[("anonymous", "anonymous"), ("ftp", "ftp")];

/// Read one (possibly multi-line) FTP response: ends at `NNN<space>`.
async fn read_response(stream: &mut TcpStream) -> Result<(u16, String), ConnectorError> {
    let mut text = String::new();
    loop {
        let line = io::recv_line(stream, DEFAULT_IO_TIMEOUT).await?;
        let done = line.len() >= 4
            && line.as_bytes()[..3].iter().all(u8::is_ascii_digit)
            && line.as_bytes()[3] == b' ';
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&line);
        if done {
            let code = line[..3].parse().unwrap_or(0);
            return Ok((code, text));
        }
        if text.len() > 8192 {
            return Err(ConnectorError::Protocol("oversized ftp response".into()));
        }
    }
}

async fn command(stream: &mut TcpStream, cmd: &str) -> Result<(u16, String), ConnectorError> {
    io::send(stream, format!("{cmd}\r\n").as_bytes(), DEFAULT_IO_TIMEOUT).await?;
    read_response(stream).await
}

struct FtpSession {
    stream: TcpStream,
    banner: String,
}

async fn login(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    pass: &str,
) -> Result<FtpSession, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;
    let (code, banner) = read_response(&mut stream).await?;
    if code != 220 {
        return Err(ConnectorError::Protocol(format!("unexpected greeting: {banner}")));
    }

    let (code, reply) = command(&mut stream, &format!("USER {user}")).await?;
    match code {
        230 => return Ok(FtpSession { stream, banner }),
        331 | 332 => {}
        _ => return Err(ConnectorError::AuthFailed(reply)),
    }
    let (code, reply) = command(&mut stream, &format!("PASS {pass}")).await?;
    if code != 230 {
        return Err(ConnectorError::AuthFailed(reply));
    }
    Ok(FtpSession { stream, banner })
}

/// Parse `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
fn parse_pasv(reply: &str) -> Option<(String, u16)> {
    let inner = reply.split('(').nth(1)?.split(')').next()?;
    let nums: Vec<u16> = inner.split(',').map(|n| n.trim().parse().ok()).collect::<Option<_>>()?;
    if nums.len() != 6 {
        return None;
    }
    let host = format!("{}.{}.{}.{}", nums[0], nums[1], nums[2], nums[3]);
    Some((host, nums[4] * 256 + nums[5]))
}

async fn list_root(session: &mut FtpSession, cx: &ProbeContext) -> Option<String> {
    let (code, reply) = command(&mut session.stream, "PASV").await.ok()?;
    if code != 227 {
        return None;
    }
    let (_, data_port) = parse_pasv(&reply)?;
    // PASV may advertise an internal address; reuse the control host
    let peer = session.stream.peer_addr().ok()?.ip().to_string();
    let mut data = cx.dial(&peer, data_port).await.ok()?;

    let (code, _) = command(&mut session.stream, "LIST").await.ok()?;
    if code != 150 && code != 125 {
        return None;
    }
    let mut listing = Vec::new();
    while let Ok(chunk) = io::recv_some(&mut data, DEFAULT_IO_TIMEOUT).await {
        if chunk.is_empty() {
            break;
        }
        listing.extend_from_slice(&chunk);
        if listing.len() > 32 * 1024 {
            break;
        }
    }
    let _ = read_response(&mut session.stream).await; // 226 transfer complete
    Some(String::from_utf8_lossy(&listing).trim_end().to_string())
}

#[async_trait]
impl Connector for FtpConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to ftp at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            login(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, mut session) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("logged in as {}", cred.username));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "ftp login accepted at {} (user: {})\n{rule}\nbanner: {}\n",
            target.addr(),
            cred.username,
            session.banner.lines().next().unwrap_or_default()
        );
        if let Ok((_, syst)) = command(&mut session.stream, "SYST").await {
            evidence.push_str(&format!("system: {syst}\n"));
        }
        if let Some(listing) = list_root(&mut session, cx).await {
            evidence.push_str("\nroot listing:\n");
            evidence.push_str(&io::clip_lines(&listing, 10));
            evidence.push('\n');
        }
        let _ = command(&mut session.stream, "QUIT").await;

        ProbeReport::success(
            format!("ftp access verified ({} login)", cred.label),
            evidence,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn pasv_reply_parses() {
        let (host, port) = parse_pasv("227 Entering Passive Mode (10,0,0,5,19,137)").unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 19 * 256 + 137);
        assert!(parse_pasv("500 nope").is_none());
    }

    #[tokio::test]
    async fn anonymous_login_succeeds_against_mock() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"220 mock ftpd ready\r\n").await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let req = String::from_utf8_lossy(&buf[..n]).to_string();
                let reply: &[u8] = if req.starts_with("USER anonymous") {
                    b"331 please send password\r\n"
                } else if req.starts_with("PASS") {
                    b"230 login ok\r\n"
                } else if req.starts_with("SYST") {
                    b"215 UNIX Type: L8\r\n"
                } else if req.starts_with("PASV") {
                    b"500 no passive\r\n"
                } else if req.starts_with("QUIT") {
                    b"221 bye\r\n"
                } else {
                    b"502 not implemented\r\n"
                };
                stream.write_all(reply).await.unwrap();
            }
        });

        let target = Target::new(Protocol::Ftp, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = FtpConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("mock ftpd ready"));
        assert!(report.evidence.contains("UNIX Type: L8"));
    }

    #[tokio::test]
    async fn rejected_password_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    stream.write_all(b"220 ready\r\n").await.unwrap();
                    let mut buf = [0u8; 256];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        let req = String::from_utf8_lossy(&buf[..n]).to_string();
                        let reply: &[u8] = if req.starts_with("USER") {
                            b"331 password required\r\n"
                        } else {
                            b"530 login incorrect\r\n"
                        };
                        let _ = stream.write_all(reply).await;
                    }
                });
            }
        });

        let target = Target::new(Protocol::Ftp, "127.0.0.1", port)
            .with_credentials(Some("root".into()), Some("wrong".into()));
        let cx = ProbeContext::new(None);
        let report = FtpConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("530"));
    }
}
