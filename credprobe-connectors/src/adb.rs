//! Android Debug Bridge wire protocol on 5555. A device banner in reply to
//! CNXN means unauthenticated debugging; an AUTH reply means the device has
//! keys enrolled. `run_command` opens a `shell:` stream.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct AdbConnector;

const CMD_CNXN: u32 = 0x4e58_4e43;
const CMD_AUTH: u32 = 0x4854_5541;
const CMD_OPEN: u32 = 0x4e45_504f;
const CMD_OKAY: u32 = 0x5941_4b4f;
const CMD_WRTE: u32 = 0x4554_5257;
const CMD_CLSE: u32 = 0x4553_4c43;

const VERSION: u32 = 0x0100_0000;
const MAX_DATA: u32 = 0x0010_0000;

fn message(command: u32, arg0: u32, arg1: u32, payload: &[u8]) -> Vec<u8> {
    let checksum: u32 = payload.iter().map(|&b| b as u32).sum();
    let mut m = Vec::with_capacity(24 + payload.len());
    m.extend_from_slice(&command.to_le_bytes());
    m.extend_from_slice(&arg0.to_le_bytes());
    m.extend_from_slice(&arg1.to_le_bytes());
    m.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    m.extend_from_slice(&checksum.to_le_bytes());
    m.extend_from_slice(&(command ^ 0xffff_ffff).to_le_bytes());
    m.extend_from_slice(payload);
    m
}

struct AdbMessage {
    command: u32,
    arg0: u32,
    payload: Vec<u8>,
}

async fn read_message(stream: &mut TcpStream) -> Result<AdbMessage, ConnectorError> {
    let h = io::recv_exact(stream, 24, DEFAULT_IO_TIMEOUT).await?;
    let word = |i: usize| u32::from_le_bytes([h[i], h[i + 1], h[i + 2], h[i + 3]]);
    let command = word(0);
    if word(20) != command ^ 0xffff_ffff {
        return Err(ConnectorError::Protocol("bad adb magic".into()));
    }
    let len = word(12) as usize;
    let payload = if len > 0 {
        io::recv_exact(stream, len, DEFAULT_IO_TIMEOUT).await?
    } else {
        Vec::new()
    };
    Ok(AdbMessage {
        command,
        arg0: word(4),
        payload,
    })
}

async fn connect_device(
    target: &Target,
    cx: &ProbeContext,
) -> Result<(TcpStream, String), ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;
    let hello = message(CMD_CNXN, VERSION, MAX_DATA, b"host::credprobe\0");
    io::send(&mut stream, &hello, DEFAULT_IO_TIMEOUT).await?;

    let reply = read_message(&mut stream).await?;
    match reply.command {
        CMD_CNXN => {
            let banner = String::from_utf8_lossy(&reply.payload)
                .trim_end_matches('\0')
                .to_string();
            Ok((stream, banner))
        }
        CMD_AUTH => Err(ConnectorError::AuthFailed(
            "device requires adb key authentication".into(),
        )),
        other => Err(ConnectorError::Protocol(format!(
            "unexpected adb command {other:#010x}"
        ))),
    }
}

fn banner_properties(banner: &str) -> Vec<(String, String)> {
    // "device::ro.product.name=x;ro.product.model=y;..."
    banner
        .splitn(2, "::")
        .nth(1)
        .unwrap_or_default()
        .split(';')
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl Connector for AdbConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Adb
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to adb at {}", target.addr()));
        let (_stream, banner) = match connect_device(target, cx).await {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log("device answered CNXN without authentication");

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "adb debugging open at {}\n{rule}\nbanner: {}\n",
            target.addr(),
            banner.split("::").next().unwrap_or(&banner)
        );
        let props = banner_properties(&banner);
        if !props.is_empty() {
            evidence.push_str("\ndevice properties:\n");
            for (k, v) in props.iter().take(10) {
                evidence.push_str(&format!("  {k}={v}\n"));
            }
        }
        ProbeReport::success("adb unauthenticated access verified", evidence)
    }

    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        cx.log(format!("opening shell: {command}"));
        let (mut stream, _) = connect_device(target, cx).await?;

        let service = format!("shell:{command}\0");
        let local_id = 1u32;
        io::send(
            &mut stream,
            &message(CMD_OPEN, local_id, 0, service.as_bytes()),
            DEFAULT_IO_TIMEOUT,
        )
        .await?;

        let mut remote_id = 0u32;
        let mut output = Vec::new();
        loop {
            let msg = match read_message(&mut stream).await {
                Ok(m) => m,
                Err(ConnectorError::Timeout) if !output.is_empty() => break,
                Err(e) => return Err(e),
            };
            match msg.command {
                CMD_OKAY => remote_id = msg.arg0,
                CMD_WRTE => {
                    output.extend_from_slice(&msg.payload);
                    let ack = message(CMD_OKAY, local_id, msg.arg0, &[]);
                    io::send(&mut stream, &ack, DEFAULT_IO_TIMEOUT).await?;
                    if output.len() > 256 * 1024 {
                        break;
                    }
                }
                CMD_CLSE => {
                    let bye = message(CMD_CLSE, local_id, remote_id, &[]);
                    let _ = io::send(&mut stream, &bye, DEFAULT_IO_TIMEOUT).await;
                    break;
                }
                _ => break,
            }
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}
