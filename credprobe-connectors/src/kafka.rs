//! Kafka: ApiVersions then Metadata, both at version 0 for the widest broker
//! compatibility. An answered Metadata request without SASL is the finding.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use tokio::net::TcpStream;

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct KafkaConnector;

const API_METADATA: i16 = 3;
const API_VERSIONS: i16 = 18;

fn request(api_key: i16, correlation: i32, body: &[u8]) -> Vec<u8> {
    let client = b"credprobe";
    let mut payload = Vec::new();
    payload.extend_from_slice(&api_key.to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes()); // api version 0
    payload.extend_from_slice(&correlation.to_be_bytes());
    payload.extend_from_slice(&(client.len() as i16).to_be_bytes());
    payload.extend_from_slice(client);
    payload.extend_from_slice(body);

    let mut out = (payload.len() as i32).to_be_bytes().to_vec();
    out.extend_from_slice(&payload);
    out
}

async fn exchange(
    stream: &mut TcpStream,
    api_key: i16,
    correlation: i32,
    body: &[u8],
) -> Result<Vec<u8>, ConnectorError> {
    io::send(stream, &request(api_key, correlation, body), DEFAULT_IO_TIMEOUT).await?;
    let size = io::recv_exact(stream, 4, DEFAULT_IO_TIMEOUT).await?;
    let len = i32::from_be_bytes([size[0], size[1], size[2], size[3]]);
    if !(4..=4 * 1024 * 1024).contains(&len) {
        return Err(ConnectorError::Protocol("implausible response size".into()));
    }
    let reply = io::recv_exact(stream, len as usize, DEFAULT_IO_TIMEOUT).await?;
    // correlation id check keeps us honest about framing
    let got = i32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
    if got != correlation {
        return Err(ConnectorError::Protocol("correlation id mismatch".into()));
    }
    Ok(reply[4..].to_vec())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn i16(&mut self) -> Option<i16> {
        let v = i16::from_be_bytes(self.data.get(self.pos..self.pos + 2)?.try_into().ok()?);
        self.pos += 2;
        Some(v)
    }

    fn i32(&mut self) -> Option<i32> {
        let v = i32::from_be_bytes(self.data.get(self.pos..self.pos + 4)?.try_into().ok()?);
        self.pos += 4;
        Some(v)
    }

    fn string(&mut self) -> Option<String> {
        let len = self.i16()?;
        if len < 0 {
            return Some(String::new());
        }
        let s = self.data.get(self.pos..self.pos + len as usize)?;
        self.pos += len as usize;
        Some(String::from_utf8_lossy(s).into_owned())
    }
}

struct Metadata {
    brokers: Vec<String>,
    topics: Vec<String>,
}

/// Metadata v0: brokers [node host port], then topics [err name partitions].
fn parse_metadata(body: &[u8]) -> Option<Metadata> {
    let mut c = Cursor { data: body, pos: 0 };
    let broker_count = c.i32()?.clamp(0, 1024);
    let mut brokers = Vec::new();
    for _ in 0..broker_count {
        let node = c.i32()?;
        let host = c.string()?;
        let port = c.i32()?;
        brokers.push(format!("{node}: {host}:{port}"));
    }
    let topic_count = c.i32()?.clamp(0, 4096);
    let mut topics = Vec::new();
    for _ in 0..topic_count {
        let _err = c.i16()?;
        topics.push(c.string()?);
        let partitions = c.i32()?.clamp(0, 4096);
        for _ in 0..partitions {
            // error, id, leader, replicas[], isr[]
            c.i16()?;
            c.i32()?;
            c.i32()?;
            let replicas = c.i32()?.clamp(0, 1024);
            for _ in 0..replicas {
                c.i32()?;
            }
            let isr = c.i32()?.clamp(0, 1024);
            for _ in 0..isr {
                c.i32()?;
            }
        }
    }
    Some(Metadata { brokers, topics })
}

#[async_trait]
impl Connector for KafkaConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Kafka
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to kafka at {}", target.addr()));
        let mut stream = match cx.dial(&target.host, target.port).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };

        let versions = match exchange(&mut stream, API_VERSIONS, 1, &[]).await {
            Ok(body) => body,
            Err(e) => return ProbeReport::from_error(&e),
        };
        let api_count = {
            let mut c = Cursor { data: &versions, pos: 0 };
            let err = c.i16().unwrap_or(-1);
            if err != 0 {
                return ProbeReport::failed(format!("ApiVersions returned error code {err}"));
            }
            c.i32().unwrap_or(0)
        };
        cx.log(format!("broker supports {api_count} api keys"));

        // Metadata v0 for all topics: empty topic array
        let metadata = match exchange(&mut stream, API_METADATA, 2, &0i32.to_be_bytes()).await {
            Ok(body) => body,
            Err(e) => return ProbeReport::from_error(&e),
        };
        let parsed = match parse_metadata(&metadata) {
            Some(m) => m,
            None => return ProbeReport::failed("could not parse Metadata response"),
        };

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "kafka metadata readable without authentication at {}\n{rule}\n",
            target.addr()
        );
        evidence.push_str(&format!("brokers ({}):\n", parsed.brokers.len()));
        for b in parsed.brokers.iter().take(10) {
            evidence.push_str(&format!("  {b}\n"));
        }
        evidence.push_str(&format!("\ntopics ({}):\n", parsed.topics.len()));
        for t in parsed.topics.iter().take(20) {
            evidence.push_str(&format!("  {t}\n"));
        }
        if parsed.topics.len() > 20 {
            evidence.push_str(&format!("  ... ({} more)\n", parsed.topics.len() - 20));
        }

        ProbeReport::success("kafka unauthenticated access verified", evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn framed(correlation: i32, body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 4) as i32).to_be_bytes().to_vec();
        out.extend_from_slice(&correlation.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn kstr(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as i16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    #[tokio::test]
    async fn metadata_brokers_and_topics_become_evidence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];

            let _ = stream.read(&mut buf).await; // ApiVersions
            let mut body = 0i16.to_be_bytes().to_vec();
            body.extend_from_slice(&1i32.to_be_bytes());
            body.extend_from_slice(&[0, 18, 0, 0, 0, 3]); // one api entry
            let _ = stream.write_all(&framed(1, &body)).await;

            let _ = stream.read(&mut buf).await; // Metadata
            let mut body = Vec::new();
            body.extend_from_slice(&1i32.to_be_bytes()); // one broker
            body.extend_from_slice(&0i32.to_be_bytes());
            kstr(&mut body, "kafka-1.internal");
            body.extend_from_slice(&9092i32.to_be_bytes());
            body.extend_from_slice(&2i32.to_be_bytes()); // two topics
            for name in ["orders", "payments"] {
                body.extend_from_slice(&0i16.to_be_bytes());
                kstr(&mut body, name);
                body.extend_from_slice(&0i32.to_be_bytes()); // no partitions
            }
            let _ = stream.write_all(&framed(2, &body)).await;
        });

        let target = Target::new(Protocol::Kafka, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = KafkaConnector.probe(&target, &cx).await;
        assert!(report.success, "{}", report.message);
        assert!(report.evidence.contains("kafka-1.internal:9092"));
        assert!(report.evidence.contains("orders"));
        assert!(report.evidence.contains("payments"));
    }

    #[test]
    fn metadata_parser_rejects_truncated_input() {
        assert!(parse_metadata(&[0, 0, 0, 5]).is_none());
    }
}
