//! MongoDB OP_MSG with a minimal BSON encoder/decoder. The probe verifies
//! unauthenticated command access; SCRAM auth is out of scope and reported
//! as such when the server demands it.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct MongoDbConnector;

const OP_MSG: i32 = 2013;

// --- minimal BSON ---------------------------------------------------------

#[derive(Default)]
struct Doc {
    body: Vec<u8>,
}

impl Doc {
    fn push_i32(&mut self, key: &str, v: i32) -> &mut Self {
        self.body.push(0x10);
        self.key(key);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn push_str(&mut self, key: &str, v: &str) -> &mut Self {
        self.body.push(0x02);
        self.key(key);
        self.body.extend_from_slice(&((v.len() + 1) as i32).to_le_bytes());
        self.body.extend_from_slice(v.as_bytes());
        self.body.push(0);
        self
    }

    #[cfg(test)]
    fn push_f64(&mut self, key: &str, v: f64) -> &mut Self {
        self.body.push(0x01);
        self.key(key);
        self.body.extend_from_slice(&v.to_le_bytes());
        self
    }

    #[cfg(test)]
    fn push_doc(&mut self, key: &str, v: &Doc) -> &mut Self {
        self.body.push(0x03);
        self.key(key);
        self.body.extend_from_slice(&v.encode());
        self
    }

    fn key(&mut self, key: &str) {
        self.body.extend_from_slice(key.as_bytes());
        self.body.push(0);
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 5);
        out.extend_from_slice(&((self.body.len() + 5) as i32).to_le_bytes());
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Double(f64),
    Str(String),
    Doc(Vec<u8>),
    I32(i32),
    I64(i64),
    Other,
}

/// Iterate the top-level elements of a BSON document body.
fn elements(doc: &[u8]) -> Vec<(String, Val)> {
    let mut out = Vec::new();
    if doc.len() < 5 {
        return out;
    }
    let mut pos = 4;
    while pos < doc.len() && doc[pos] != 0 {
        let kind = doc[pos];
        pos += 1;
        let name_start = pos;
        while pos < doc.len() && doc[pos] != 0 {
            pos += 1;
        }
        let name = String::from_utf8_lossy(&doc[name_start..pos]).into_owned();
        pos += 1;
        let val = match kind {
            0x01 if pos + 8 <= doc.len() => {
                let v = f64::from_le_bytes(doc[pos..pos + 8].try_into().unwrap_or_default());
                pos += 8;
                Val::Double(v)
            }
            0x02 if pos + 4 <= doc.len() => {
                let len = i32::from_le_bytes(doc[pos..pos + 4].try_into().unwrap_or_default())
                    .max(1) as usize;
                let start = pos + 4;
                let end = (start + len - 1).min(doc.len());
                pos = start + len;
                Val::Str(String::from_utf8_lossy(&doc[start.min(doc.len())..end]).into_owned())
            }
            0x03 | 0x04 if pos + 4 <= doc.len() => {
                let len = i32::from_le_bytes(doc[pos..pos + 4].try_into().unwrap_or_default())
                    .max(5) as usize;
                let end = (pos + len).min(doc.len());
                let inner = doc[pos..end].to_vec();
                pos = end;
                Val::Doc(inner)
            }
            0x08 => {
                pos += 1;
                Val::Other
            }
            0x10 if pos + 4 <= doc.len() => {
                let v = i32::from_le_bytes(doc[pos..pos + 4].try_into().unwrap_or_default());
                pos += 4;
                Val::I32(v)
            }
            0x12 if pos + 8 <= doc.len() => {
                let v = i64::from_le_bytes(doc[pos..pos + 8].try_into().unwrap_or_default());
                pos += 8;
                Val::I64(v)
            }
            // anything else ends the walk; we only need the common scalars
            _ => break,
        };
        out.push((name, val));
    }
    out
}

fn find<'a>(doc: &'a [(String, Val)], key: &str) -> Option<&'a Val> {
    doc.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

// --- wire ------------------------------------------------------------------

async fn run_admin_command(
    stream: &mut TcpStream,
    request_id: i32,
    command: &mut Doc,
) -> Result<Vec<(String, Val)>, ConnectorError> {
    let body = command.push_str("$db", "admin").encode();

    let mut msg = Vec::new();
    msg.extend_from_slice(&((16 + 4 + 1 + body.len()) as i32).to_le_bytes());
    msg.extend_from_slice(&request_id.to_le_bytes());
    msg.extend_from_slice(&0i32.to_le_bytes());
    msg.extend_from_slice(&OP_MSG.to_le_bytes());
    msg.extend_from_slice(&0u32.to_le_bytes()); // flags
    msg.push(0); // section kind: body
    msg.extend_from_slice(&body);
    io::send(stream, &msg, DEFAULT_IO_TIMEOUT).await?;

    let header = io::recv_exact(stream, 16, DEFAULT_IO_TIMEOUT).await?;
    let total = i32::from_le_bytes(header[0..4].try_into().unwrap_or_default()) as usize;
    if !(21..=16 * 1024 * 1024).contains(&total) {
        return Err(ConnectorError::Protocol("bad message length".into()));
    }
    let rest = io::recv_exact(stream, total - 16, DEFAULT_IO_TIMEOUT).await?;
    // flags(4) + kind(1) + document
    let doc = rest
        .get(5..)
        .ok_or_else(|| ConnectorError::Protocol("short reply".into()))?;
    let fields = elements(doc);

    if let Some(Val::Double(ok)) = find(&fields, "ok") {
        if *ok != 1.0 {
            let msg = match find(&fields, "errmsg") {
                Some(Val::Str(m)) => m.clone(),
                _ => "command failed".to_string(),
            };
            if msg.contains("auth") || msg.contains("Unauthorized") {
                return Err(ConnectorError::AuthFailed(msg));
            }
            return Err(ConnectorError::Protocol(msg));
        }
    }
    Ok(fields)
}

#[async_trait]
impl Connector for MongoDbConnector {
    fn protocol(&self) -> Protocol {
        Protocol::MongoDb
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        if target.username.is_some() || target.password.is_some() {
            return ProbeReport::failed(
                "mongodb SCRAM authentication is not supported; probe tests unauthenticated access only",
            );
        }

        cx.log(format!("connecting to mongodb at {}", target.addr()));
        let mut stream = match cx.dial(&target.host, target.port).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };

        let hello = match run_admin_command(&mut stream, 1, Doc::default().push_i32("hello", 1))
            .await
        {
            Ok(fields) => fields,
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log("hello accepted");

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "mongodb commands accepted without authentication at {}\n{rule}\n",
            target.addr()
        );
        if let Some(Val::I32(wire)) = find(&hello, "maxWireVersion") {
            evidence.push_str(&format!("max wire version: {wire}\n"));
        }

        if let Ok(build) =
            run_admin_command(&mut stream, 2, Doc::default().push_i32("buildInfo", 1)).await
        {
            if let Some(Val::Str(version)) = find(&build, "version") {
                evidence.push_str(&format!("server version: {version}\n"));
                cx.log(format!("server version {version}"));
            }
        }

        match run_admin_command(&mut stream, 3, Doc::default().push_i32("listDatabases", 1)).await
        {
            Ok(fields) => {
                if let Some(Val::Doc(array)) = find(&fields, "databases") {
                    evidence.push_str("\ndatabases:\n");
                    let mut shown = 0;
                    for (_, entry) in elements(array) {
                        if let Val::Doc(db) = entry {
                            let db_fields = elements(&db);
                            let name = match find(&db_fields, "name") {
                                Some(Val::Str(n)) => n.clone(),
                                _ => continue,
                            };
                            let size = match find(&db_fields, "sizeOnDisk") {
                                Some(Val::Double(s)) => format!(" ({s} bytes)"),
                                Some(Val::I64(s)) => format!(" ({s} bytes)"),
                                _ => String::new(),
                            };
                            evidence.push_str(&format!("  {name}{size}\n"));
                            shown += 1;
                            if shown >= 10 {
                                break;
                            }
                        }
                    }
                }
            }
            Err(ConnectorError::AuthFailed(msg)) => {
                return ProbeReport::failed(format!("listDatabases requires auth: {msg}"));
            }
            Err(e) => cx.log(format!("listDatabases failed: {e}")),
        }

        ProbeReport::success("mongodb unauthenticated access verified", evidence)
    }
}
