//! MySQL client/server protocol, speaking just enough of protocol 10 to
//! authenticate with `mysql_native_password` and run `SHOW DATABASES`.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{candidates, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct MySqlConnector;

const DEFAULTS: &[(&str, &str)] = &[("root", "")];

const NATIVE_PLUGIN: &str = "mysql_native_password";

// capability flags we advertise
const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

async fn read_packet(stream: &mut TcpStream) -> Result<(u8, Vec<u8>), ConnectorError> {
    let header = io::recv_exact(stream, 4, DEFAULT_IO_TIMEOUT).await?;
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    let payload = io::recv_exact(stream, len, DEFAULT_IO_TIMEOUT).await?;
    Ok((header[3], payload))
}

async fn write_packet(stream: &mut TcpStream, seq: u8, payload: &[u8]) -> Result<(), ConnectorError> {
    let len = payload.len();
    let mut pkt = vec![
        (len & 0xff) as u8,
        ((len >> 8) & 0xff) as u8,
        ((len >> 16) & 0xff) as u8,
        seq,
    ];
    pkt.extend_from_slice(payload);
    io::send(stream, &pkt, DEFAULT_IO_TIMEOUT).await
}

fn cstr(buf: &[u8], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < buf.len() && buf[*pos] != 0 {
        *pos += 1;
    }
    let s = String::from_utf8_lossy(&buf[start..*pos]).into_owned();
    *pos += 1;
    s
}

struct Handshake {
    server_version: String,
    salt: Vec<u8>,
    auth_plugin: String,
}

fn parse_handshake(payload: &[u8]) -> Result<Handshake, ConnectorError> {
    if payload.first() == Some(&0xff) {
        let msg = String::from_utf8_lossy(payload.get(9..).unwrap_or_default());
        return Err(ConnectorError::Connection(format!("server refused: {msg}")));
    }
    if payload.first() != Some(&0x0a) {
        return Err(ConnectorError::Protocol("not a mysql handshake".into()));
    }
    let mut pos = 1;
    let server_version = cstr(payload, &mut pos);
    pos += 4; // thread id
    if payload.len() < pos + 8 {
        return Err(ConnectorError::Protocol("truncated handshake".into()));
    }
    let mut salt = payload[pos..pos + 8].to_vec();
    pos += 8 + 1; // salt part 1, filler
    pos += 2 + 1 + 2 + 2; // cap low, charset, status, cap high
    let auth_len = *payload.get(pos).unwrap_or(&0) as usize;
    pos += 1 + 10; // auth data len, reserved
    if auth_len > 8 && payload.len() > pos {
        let part2 = (auth_len - 8 - 1).min(payload.len() - pos);
        salt.extend_from_slice(&payload[pos..pos + part2]);
        pos += part2 + 1; // trailing nul
    }
    let auth_plugin = if pos < payload.len() {
        cstr(payload, &mut pos)
    } else {
        NATIVE_PLUGIN.to_string()
    };
    Ok(Handshake {
        server_version,
        salt,
        auth_plugin,
    })
}

/// SHA1(pass) XOR SHA1(salt + SHA1(SHA1(pass)))
fn native_scramble(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let mask = hasher.finalize();
    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

fn handshake_response(user: &str, scramble: &[u8]) -> Vec<u8> {
    let caps =
        CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
    let mut p = Vec::new();
    p.extend_from_slice(&caps.to_le_bytes());
    p.extend_from_slice(&(16 * 1024 * 1024u32).to_le_bytes());
    p.push(33); // utf8_general_ci
    p.extend_from_slice(&[0u8; 23]);
    p.extend_from_slice(user.as_bytes());
    p.push(0);
    p.push(scramble.len() as u8);
    p.extend_from_slice(scramble);
    p.extend_from_slice(NATIVE_PLUGIN.as_bytes());
    p.push(0);
    p
}

fn err_message(payload: &[u8]) -> String {
    // 0xff, code u16, '#' + sqlstate(5), message
    let body = payload.get(3..).unwrap_or_default();
    let body = if body.first() == Some(&b'#') { &body[6..] } else { body };
    String::from_utf8_lossy(body).into_owned()
}

async fn authenticate(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    password: &str,
) -> Result<(TcpStream, String), ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;
    let (seq, payload) = read_packet(&mut stream).await?;
    let hs = parse_handshake(&payload)?;

    if hs.auth_plugin != NATIVE_PLUGIN {
        return Err(ConnectorError::UnsupportedAuth(hs.auth_plugin));
    }
    let salt = &hs.salt[..hs.salt.len().min(20)];
    let resp = handshake_response(user, &native_scramble(password, salt));
    write_packet(&mut stream, seq + 1, &resp).await?;

    let (seq, mut payload) = read_packet(&mut stream).await?;
    if payload.first() == Some(&0xfe) {
        // AuthSwitchRequest: plugin name + fresh salt
        let mut pos = 1;
        let plugin = cstr(&payload, &mut pos);
        if plugin != NATIVE_PLUGIN {
            return Err(ConnectorError::UnsupportedAuth(plugin));
        }
        let new_salt: Vec<u8> = payload[pos..].iter().copied().filter(|&b| b != 0).collect();
        write_packet(&mut stream, seq + 1, &native_scramble(password, &new_salt)).await?;
        let (_, next) = read_packet(&mut stream).await?;
        payload = next;
    }

    match payload.first() {
        Some(&0x00) => Ok((stream, hs.server_version)),
        Some(&0xff) => Err(ConnectorError::AuthFailed(err_message(&payload))),
        _ => Err(ConnectorError::Protocol("unexpected auth reply".into())),
    }
}

fn lenenc_str(payload: &[u8]) -> Option<String> {
    let len = *payload.first()? as usize;
    if len >= 0xfb {
        return None;
    }
    Some(String::from_utf8_lossy(payload.get(1..1 + len)?).into_owned())
}

async fn show_databases(stream: &mut TcpStream) -> Result<Vec<String>, ConnectorError> {
    let mut query = vec![0x03u8]; // COM_QUERY
    query.extend_from_slice(b"SHOW DATABASES");
    write_packet(stream, 0, &query).await?;

    let mut names = Vec::new();
    let mut in_rows = false;
    let (_, first) = read_packet(stream).await?;
    if first.first() == Some(&0xff) {
        return Err(ConnectorError::Protocol(err_message(&first)));
    }
    loop {
        let (_, payload) = read_packet(stream).await?;
        let eof = payload.first() == Some(&0xfe) && payload.len() < 9;
        if eof {
            if in_rows {
                break;
            }
            in_rows = true;
            continue;
        }
        if in_rows {
            if let Some(name) = lenenc_str(&payload) {
                names.push(name);
            }
        }
        if names.len() > 64 {
            break;
        }
    }
    Ok(names)
}

#[async_trait]
impl Connector for MySqlConnector {
    fn protocol(&self) -> Protocol {
        Protocol::MySql
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to mysql at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            authenticate(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, (mut stream, version)) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("authenticated as {} (server {version})", cred.username));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "mysql login accepted at {} (user: {})\n{rule}\nserver version: {version}\n",
            target.addr(),
            cred.username
        );
        match show_databases(&mut stream).await {
            Ok(names) => {
                evidence.push_str(&format!("\ndatabases ({}):\n", names.len()));
                for name in names.iter().take(10) {
                    evidence.push_str(&format!("  {name}\n"));
                }
                if names.len() > 10 {
                    evidence.push_str(&format!("  ... ({} more)\n", names.len() - 10));
                }
            }
            Err(e) => cx.log(format!("SHOW DATABASES failed: {e}")),
        }

        ProbeReport::success(
            format!("mysql access verified ({} credentials)", cred.label),
            evidence,
        )
    }
}
