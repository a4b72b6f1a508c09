//! RFB (VNC) with None and classic DES challenge auth, plus a raw-encoding
//! screen capture composited through the framebuffer canvas.

use std::time::Duration;

use async_trait::async_trait;
use cipher::{BlockEncrypt, KeyInit};
use credprobe_fb::Canvas;
use credprobe_types::{Protocol, Target, IMAGE_MARKER_CLOSE, IMAGE_MARKER_OPEN};
use des::Des;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct VncConnector;

const SECURITY_NONE: u8 = 1;
const SECURITY_VNC_AUTH: u8 = 2;
const ENCODING_RAW: i32 = 0;
const CAPTURE_DEADLINE: Duration = Duration::from_secs(6);

/// Classic RFB challenge: DES-ECB with the password as key, each key byte
/// bit-reversed.
fn encrypt_challenge(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (i, b) in password.bytes().take(8).enumerate() {
        key[i] = b.reverse_bits();
    }
    let cipher = match Des::new_from_slice(&key) {
        Ok(c) => c,
        Err(_) => return *challenge,
    };
    let mut out = *challenge;
    for block in out.chunks_exact_mut(8) {
        cipher.encrypt_block(block.into());
    }
    out
}

struct VncSession {
    stream: TcpStream,
    width: u16,
    height: u16,
    desktop_name: String,
    auth_mode: &'static str,
}

async fn recv_u32(stream: &mut TcpStream) -> Result<u32, ConnectorError> {
    let b = io::recv_exact(stream, 4, DEFAULT_IO_TIMEOUT).await?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

async fn read_failure_reason(stream: &mut TcpStream) -> String {
    match recv_u32(stream).await {
        Ok(len) if len <= 1024 => io::recv_exact(stream, len as usize, DEFAULT_IO_TIMEOUT)
            .await
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

async fn handshake(
    target: &Target,
    cx: &ProbeContext,
) -> Result<VncSession, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;

    let greeting = io::recv_exact(&mut stream, 12, DEFAULT_IO_TIMEOUT).await?;
    if !greeting.starts_with(b"RFB ") {
        return Err(ConnectorError::Protocol("not an RFB service".into()));
    }
    let version = String::from_utf8_lossy(&greeting).trim_end().to_string();
    cx.log(format!("server version: {version}"));
    // 3.3 has a different security negotiation; everything 3.7+ takes the
    // type-list form
    let legacy = version.as_str() < "RFB 003.007";
    let ours: &[u8] = if legacy { b"RFB 003.003\n" } else { b"RFB 003.008\n" };
    io::send(&mut stream, ours, DEFAULT_IO_TIMEOUT).await?;

    let security = if legacy {
        match recv_u32(&mut stream).await? {
            0 => {
                let reason = read_failure_reason(&mut stream).await;
                return Err(ConnectorError::Protocol(format!("server refused: {reason}")));
            }
            t => t as u8,
        }
    } else {
        let count = io::recv_exact(&mut stream, 1, DEFAULT_IO_TIMEOUT).await?[0] as usize;
        if count == 0 {
            let reason = read_failure_reason(&mut stream).await;
            return Err(ConnectorError::Protocol(format!("server refused: {reason}")));
        }
        let types = io::recv_exact(&mut stream, count, DEFAULT_IO_TIMEOUT).await?;
        let chosen = if types.contains(&SECURITY_NONE) {
            SECURITY_NONE
        } else if types.contains(&SECURITY_VNC_AUTH) {
            SECURITY_VNC_AUTH
        } else {
            return Err(ConnectorError::UnsupportedAuth(format!(
                "server offers security types {types:?}"
            )));
        };
        io::send(&mut stream, &[chosen], DEFAULT_IO_TIMEOUT).await?;
        chosen
    };

    let auth_mode = match security {
        SECURITY_NONE => {
            cx.log("security type None accepted");
            // 3.8 still sends a SecurityResult for None
            if !legacy && recv_u32(&mut stream).await? != 0 {
                return Err(ConnectorError::AuthFailed("security result not ok".into()));
            }
            "none (no password)"
        }
        SECURITY_VNC_AUTH => {
            let password = target.password.clone().ok_or_else(|| {
                ConnectorError::AuthFailed("server requires a vnc password".into())
            })?;
            cx.log("answering DES challenge");
            let raw = io::recv_exact(&mut stream, 16, DEFAULT_IO_TIMEOUT).await?;
            let mut challenge = [0u8; 16];
            challenge.copy_from_slice(&raw);
            let response = encrypt_challenge(&password, &challenge);
            io::send(&mut stream, &response, DEFAULT_IO_TIMEOUT).await?;
            if recv_u32(&mut stream).await? != 0 {
                let reason = if legacy {
                    String::new()
                } else {
                    read_failure_reason(&mut stream).await
                };
                return Err(ConnectorError::AuthFailed(if reason.is_empty() {
                    "vnc password rejected".into()
                } else {
                    reason
                }));
            }
            "vnc password"
        }
        other => {
            return Err(ConnectorError::UnsupportedAuth(format!(
                "security type {other}"
            )))
        }
    };

    // ClientInit: shared session
    io::send(&mut stream, &[1], DEFAULT_IO_TIMEOUT).await?;
    let init = io::recv_exact(&mut stream, 24, DEFAULT_IO_TIMEOUT).await?;
    let width = u16::from_be_bytes([init[0], init[1]]);
    let height = u16::from_be_bytes([init[2], init[3]]);
    let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]).min(1024);
    let desktop_name = if name_len > 0 {
        let raw = io::recv_exact(&mut stream, name_len as usize, DEFAULT_IO_TIMEOUT).await?;
        String::from_utf8_lossy(&raw).into_owned()
    } else {
        String::new()
    };

    Ok(VncSession {
        stream,
        width,
        height,
        desktop_name,
        auth_mode,
    })
}

/// Ask for 32-bit BGRA little-endian so every server sends the one format
/// the canvas converter handles directly.
fn set_pixel_format() -> [u8; 20] {
    let mut m = [0u8; 20];
    m[4] = 32; // bits per pixel
    m[5] = 24; // depth
    m[7] = 1; // true colour
    m[8..10].copy_from_slice(&255u16.to_be_bytes());
    m[10..12].copy_from_slice(&255u16.to_be_bytes());
    m[12..14].copy_from_slice(&255u16.to_be_bytes());
    m[14] = 16; // red shift
    m[15] = 8; // green shift
    m[16] = 0; // blue shift
    m
}

async fn capture(session: &mut VncSession, cx: &ProbeContext) -> Result<String, ConnectorError> {
    let stream = &mut session.stream;
    io::send(stream, &set_pixel_format(), DEFAULT_IO_TIMEOUT).await?;

    let mut encodings = vec![2u8, 0, 0, 1];
    encodings.extend_from_slice(&ENCODING_RAW.to_be_bytes());
    io::send(stream, &encodings, DEFAULT_IO_TIMEOUT).await?;

    let mut request = vec![3u8, 0]; // non-incremental, full screen
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&session.width.to_be_bytes());
    request.extend_from_slice(&session.height.to_be_bytes());
    io::send(stream, &request, DEFAULT_IO_TIMEOUT).await?;

    let mut canvas = Canvas::new(session.width, session.height);
    let deadline = Instant::now() + CAPTURE_DEADLINE;
    'messages: while Instant::now() < deadline && canvas.updates_applied() == 0 {
        let kind = io::recv_exact(stream, 1, DEFAULT_IO_TIMEOUT).await?[0];
        match kind {
            0 => {
                let head = io::recv_exact(stream, 3, DEFAULT_IO_TIMEOUT).await?;
                let rects = u16::from_be_bytes([head[1], head[2]]);
                for _ in 0..rects {
                    let r = io::recv_exact(stream, 12, DEFAULT_IO_TIMEOUT).await?;
                    let x = u16::from_be_bytes([r[0], r[1]]);
                    let y = u16::from_be_bytes([r[2], r[3]]);
                    let w = u16::from_be_bytes([r[4], r[5]]);
                    let h = u16::from_be_bytes([r[6], r[7]]);
                    let encoding = i32::from_be_bytes([r[8], r[9], r[10], r[11]]);
                    if encoding != ENCODING_RAW {
                        cx.log(format!("stopping at unexpected encoding {encoding}"));
                        break 'messages;
                    }
                    let bytes = w as usize * h as usize * 4;
                    if bytes > 64 * 1024 * 1024 {
                        return Err(ConnectorError::Protocol("oversized rect".into()));
                    }
                    let data = io::recv_exact(stream, bytes, DEFAULT_IO_TIMEOUT).await?;
                    canvas
                        .push_bitmap(x, y, w, h, 32, &data, false)
                        .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
                }
            }
            // ServerCutText / Bell and anything else ends the capture
            _ => break,
        }
    }

    if canvas.updates_applied() == 0 {
        return Err(ConnectorError::Protocol("no framebuffer update received".into()));
    }
    cx.log(format!(
        "captured {} rect(s) at {}x{}",
        canvas.updates_applied(),
        session.width,
        session.height
    ));
    let png = canvas
        .to_png_base64()
        .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
    Ok(format!("{IMAGE_MARKER_OPEN}{png}{IMAGE_MARKER_CLOSE}"))
}

#[async_trait]
impl Connector for VncConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Vnc
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to vnc at {}", target.addr()));
        let mut session = match handshake(target, cx).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "vnc session established at {}\n{rule}\nauthentication: {}\ndesktop: {}\ngeometry: {}x{}\n",
            target.addr(),
            session.auth_mode,
            if session.desktop_name.is_empty() {
                "(unnamed)"
            } else {
                &session.desktop_name
            },
            session.width,
            session.height
        );
        match capture(&mut session, cx).await {
            Ok(image) => {
                evidence.push_str("\nscreen capture:\n");
                evidence.push_str(&image);
                evidence.push('\n');
            }
            Err(e) => cx.log(format!("capture skipped: {e}")),
        }
        ProbeReport::success("vnc access verified", evidence)
    }

    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        if command.trim() != "screenshot" {
            return Err(ConnectorError::Protocol(
                "vnc supports only the screenshot command".into(),
            ));
        }
        let mut session = handshake(target, cx).await?;
        capture(&mut session, cx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn challenge_response_is_deterministic_and_keyed() {
        let challenge = [0x5A; 16];
        let a = encrypt_challenge("secret", &challenge);
        let b = encrypt_challenge("secret", &challenge);
        let c = encrypt_challenge("other", &challenge);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, challenge);
    }

    fn server_init(width: u16, height: u16, name: &str) -> Vec<u8> {
        let mut m = Vec::new();
        m.extend_from_slice(&width.to_be_bytes());
        m.extend_from_slice(&height.to_be_bytes());
        m.extend_from_slice(&[0u8; 16]); // native pixel format (overridden)
        m.extend_from_slice(&(name.len() as u32).to_be_bytes());
        m.extend_from_slice(name.as_bytes());
        m
    }

    #[tokio::test]
    async fn none_auth_with_raw_capture() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"RFB 003.008\n").await.unwrap();
            let mut buf = [0u8; 12];
            stream.read_exact(&mut buf).await.unwrap(); // client version
            stream.write_all(&[1, SECURITY_NONE]).await.unwrap();
            stream.read_exact(&mut buf[..1]).await.unwrap(); // chosen type
            stream.write_all(&0u32.to_be_bytes()).await.unwrap(); // result
            stream.read_exact(&mut buf[..1]).await.unwrap(); // ClientInit
            stream.write_all(&server_init(4, 2, "mock desk")).await.unwrap();

            // SetPixelFormat(20) + SetEncodings(8) + UpdateRequest(10)
            let mut msgs = [0u8; 38];
            stream.read_exact(&mut msgs).await.unwrap();

            let mut update = vec![0u8, 0, 0, 1]; // one rect
            update.extend_from_slice(&0u16.to_be_bytes());
            update.extend_from_slice(&0u16.to_be_bytes());
            update.extend_from_slice(&4u16.to_be_bytes());
            update.extend_from_slice(&2u16.to_be_bytes());
            update.extend_from_slice(&ENCODING_RAW.to_be_bytes());
            for _ in 0..(4 * 2) {
                update.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]); // blue BGRA
            }
            stream.write_all(&update).await.unwrap();
        });

        let target = Target::new(Protocol::Vnc, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = VncConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("mock desk"));
        assert!(report.evidence.contains("4x2"));
        assert!(report.evidence.contains(IMAGE_MARKER_OPEN));
        assert!(report.evidence.contains(IMAGE_MARKER_CLOSE));
    }

    #[tokio::test]
    async fn rejected_password_is_auth_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"RFB 003.008\n").await.unwrap();
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf[..12]).await.unwrap();
            stream.write_all(&[1, SECURITY_VNC_AUTH]).await.unwrap();
            stream.read_exact(&mut buf[..1]).await.unwrap();
            stream.write_all(&[0x33; 16]).await.unwrap(); // challenge
            stream.read_exact(&mut buf).await.unwrap(); // response
            stream.write_all(&1u32.to_be_bytes()).await.unwrap();
            let reason = b"Authentication failure";
            stream
                .write_all(&(reason.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(reason).await.unwrap();
        });

        let target = Target::new(Protocol::Vnc, "127.0.0.1", port)
            .with_credentials(None, Some("wrong".into()));
        let cx = ProbeContext::new(None);
        let report = VncConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("Authentication failure"));
    }

    #[tokio::test]
    async fn password_required_but_missing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"RFB 003.008\n").await.unwrap();
            let mut buf = [0u8; 12];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&[1, SECURITY_VNC_AUTH]).await.unwrap();
        });

        let target = Target::new(Protocol::Vnc, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = VncConnector.probe(&target, &cx).await;
        assert!(!report.success);
        assert!(report.message.contains("password"));
    }
}
