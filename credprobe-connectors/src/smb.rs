//! SMB2 over direct TCP. Negotiate, NTLMSSP session setup (anonymous, guest
//! or NTLMv2 with supplied credentials), then a TREE_CONNECT to IPC$ as the
//! access proof.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{candidates, ntlm, prober, Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct SmbConnector;

const DEFAULTS: &[(&str, &str)] = &[("", ""), ("guest", "")];

const SMB2_NEGOTIATE: u16 = 0;
const SMB2_SESSION_SETUP: u16 = 1;
const SMB2_TREE_CONNECT: u16 = 3;

const STATUS_SUCCESS: u32 = 0;
const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;
const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;
const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;

const SESSION_FLAG_IS_GUEST: u16 = 0x0001;
const SESSION_FLAG_IS_NULL: u16 = 0x0002;

const DIALECTS: &[u16] = &[0x0202, 0x0210, 0x0300, 0x0302];

fn dialect_name(revision: u16) -> &'static str {
    match revision {
        0x0202 => "SMB 2.0.2",
        0x0210 => "SMB 2.1",
        0x0300 => "SMB 3.0",
        0x0302 => "SMB 3.0.2",
        0x0311 => "SMB 3.1.1",
        _ => "unknown dialect",
    }
}

struct Reply {
    status: u32,
    session_id: u64,
    body: Vec<u8>,
}

struct SmbClient {
    stream: TcpStream,
    message_id: u64,
    session_id: u64,
}

impl SmbClient {
    async fn connect(target: &Target, cx: &ProbeContext) -> Result<Self, ConnectorError> {
        let stream = cx.dial(&target.host, target.port).await?;
        Ok(Self {
            stream,
            message_id: 0,
            session_id: 0,
        })
    }

    fn header(&mut self, command: u16) -> Vec<u8> {
        let mut h = vec![0xFE, b'S', b'M', b'B'];
        h.extend_from_slice(&64u16.to_le_bytes()); // structure size
        h.extend_from_slice(&0u16.to_le_bytes()); // credit charge
        h.extend_from_slice(&0u32.to_le_bytes()); // status / channel sequence
        h.extend_from_slice(&command.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes()); // credits requested
        h.extend_from_slice(&0u32.to_le_bytes()); // flags
        h.extend_from_slice(&0u32.to_le_bytes()); // next command
        h.extend_from_slice(&self.message_id.to_le_bytes());
        h.extend_from_slice(&0u32.to_le_bytes()); // process id
        h.extend_from_slice(&0u32.to_le_bytes()); // tree id
        h.extend_from_slice(&self.session_id.to_le_bytes());
        h.extend_from_slice(&[0u8; 16]); // signature
        self.message_id += 1;
        h
    }

    async fn exchange(&mut self, command: u16, body: &[u8]) -> Result<Reply, ConnectorError> {
        let mut message = self.header(command);
        message.extend_from_slice(body);

        // NetBIOS session header: zero type byte plus 24-bit length
        let len = message.len();
        let mut framed = vec![0, (len >> 16) as u8, (len >> 8) as u8, len as u8];
        framed.extend_from_slice(&message);
        io::send(&mut self.stream, &framed, DEFAULT_IO_TIMEOUT).await?;

        let nb = io::recv_exact(&mut self.stream, 4, DEFAULT_IO_TIMEOUT).await?;
        let reply_len =
            ((nb[1] as usize) << 16) | ((nb[2] as usize) << 8) | nb[3] as usize;
        if !(64..=1024 * 1024).contains(&reply_len) {
            return Err(ConnectorError::Protocol("implausible smb frame size".into()));
        }
        let reply = io::recv_exact(&mut self.stream, reply_len, DEFAULT_IO_TIMEOUT).await?;
        if &reply[..4] != b"\xFESMB" {
            return Err(ConnectorError::Protocol("not an smb2 response".into()));
        }
        let status = u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]);
        let session_id = u64::from_le_bytes([
            reply[40], reply[41], reply[42], reply[43], reply[44], reply[45], reply[46],
            reply[47],
        ]);
        Ok(Reply {
            status,
            session_id,
            body: reply[64..].to_vec(),
        })
    }

    async fn negotiate(&mut self) -> Result<(u16, bool), ConnectorError> {
        let mut body = Vec::new();
        body.extend_from_slice(&36u16.to_le_bytes());
        body.extend_from_slice(&(DIALECTS.len() as u16).to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes()); // signing enabled
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // capabilities
        body.extend_from_slice(&[0u8; 16]); // client guid
        body.extend_from_slice(&[0u8; 8]); // client start time
        for d in DIALECTS {
            body.extend_from_slice(&d.to_le_bytes());
        }

        let reply = self.exchange(SMB2_NEGOTIATE, &body).await?;
        if reply.status != STATUS_SUCCESS || reply.body.len() < 20 {
            return Err(ConnectorError::Protocol(format!(
                "negotiate failed with status {:#010x}",
                reply.status
            )));
        }
        let security_mode = u16::from_le_bytes([reply.body[2], reply.body[3]]);
        let dialect = u16::from_le_bytes([reply.body[4], reply.body[5]]);
        Ok((dialect, security_mode & 0x0002 != 0))
    }

    fn session_setup_body(token: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&25u16.to_le_bytes());
        body.push(0); // flags
        body.push(1); // signing enabled
        body.extend_from_slice(&0u32.to_le_bytes()); // capabilities
        body.extend_from_slice(&0u32.to_le_bytes()); // channel
        body.extend_from_slice(&((64 + 24) as u16).to_le_bytes());
        body.extend_from_slice(&(token.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // previous session id
        body.extend_from_slice(token);
        body
    }

    /// Full NTLMSSP dance. Returns (session flags, target name).
    async fn session_setup(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<(u16, String), ConnectorError> {
        let body = Self::session_setup_body(&ntlm::negotiate_message());
        let reply = self.exchange(SMB2_SESSION_SETUP, &body).await?;
        if reply.status != STATUS_MORE_PROCESSING_REQUIRED {
            return Err(ConnectorError::Protocol(format!(
                "expected NTLMSSP challenge, got status {:#010x}",
                reply.status
            )));
        }
        self.session_id = reply.session_id;

        // the challenge may arrive SPNEGO-wrapped; find the raw NTLMSSP token
        let token_at = reply
            .body
            .windows(8)
            .position(|w| w == b"NTLMSSP\0")
            .ok_or_else(|| ConnectorError::Protocol("no NTLMSSP token in challenge".into()))?;
        let challenge = ntlm::parse_challenge(&reply.body[token_at..])?;
        let target_name = challenge.target_name.clone();

        let auth = ntlm::authenticate_message(user, &target_name, password, &challenge);
        let body = Self::session_setup_body(&auth);
        let reply = self.exchange(SMB2_SESSION_SETUP, &body).await?;
        match reply.status {
            STATUS_SUCCESS => {
                let flags = if reply.body.len() >= 4 {
                    u16::from_le_bytes([reply.body[2], reply.body[3]])
                } else {
                    0
                };
                Ok((flags, target_name))
            }
            STATUS_LOGON_FAILURE => Err(ConnectorError::AuthFailed("logon failure".into())),
            STATUS_ACCESS_DENIED => Err(ConnectorError::AuthFailed("access denied".into())),
            other => Err(ConnectorError::Protocol(format!(
                "session setup failed with status {other:#010x}"
            ))),
        }
    }

    async fn tree_connect_ipc(&mut self, host: &str) -> Result<bool, ConnectorError> {
        let path: Vec<u8> = format!("\\\\{host}\\IPC$")
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        let mut body = Vec::new();
        body.extend_from_slice(&9u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&((64 + 8) as u16).to_le_bytes());
        body.extend_from_slice(&(path.len() as u16).to_le_bytes());
        body.extend_from_slice(&path);
        let reply = self.exchange(SMB2_TREE_CONNECT, &body).await?;
        Ok(reply.status == STATUS_SUCCESS)
    }
}

struct SmbAccess {
    dialect: u16,
    signing_required: bool,
    session_flags: u16,
    target_name: String,
    ipc_connected: bool,
}

async fn attempt(
    target: &Target,
    cx: &ProbeContext,
    user: &str,
    password: &str,
) -> Result<SmbAccess, ConnectorError> {
    let mut client = SmbClient::connect(target, cx).await?;
    let (dialect, signing_required) = client.negotiate().await?;
    let (session_flags, target_name) = client.session_setup(user, password).await?;
    let ipc_connected = client.tree_connect_ipc(&target.host).await.unwrap_or(false);
    Ok(SmbAccess {
        dialect,
        signing_required,
        session_flags,
        target_name,
        ipc_connected,
    })
}

#[async_trait]
impl Connector for SmbConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Smb
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to smb at {}", target.addr()));
        let list = candidates(target, DEFAULTS);
        let result = prober::run(cx, list, |cred| async move {
            attempt(target, cx, &cred.username, &cred.password).await
        })
        .await;

        let (cred, access) = match result {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!(
            "session established ({})",
            dialect_name(access.dialect)
        ));

        let who = if cred.is_anonymous() {
            "anonymous".to_string()
        } else {
            cred.username.clone()
        };
        let session_kind = if access.session_flags & SESSION_FLAG_IS_NULL != 0 {
            "null session"
        } else if access.session_flags & SESSION_FLAG_IS_GUEST != 0 {
            "guest session"
        } else {
            "authenticated session"
        };

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "smb session established at {} (user: {who})\n{rule}\ndialect: {}\nsigning required: {}\nsession type: {session_kind}\n",
            target.addr(),
            dialect_name(access.dialect),
            if access.signing_required { "yes" } else { "no" },
        );
        if !access.target_name.is_empty() {
            evidence.push_str(&format!("server identity: {}\n", access.target_name));
        }
        evidence.push_str(&format!(
            "IPC$ tree connect: {}\n",
            if access.ipc_connected { "accepted" } else { "refused" }
        ));

        ProbeReport::success(format!("smb access verified ({session_kind})"), evidence)
    }
}
