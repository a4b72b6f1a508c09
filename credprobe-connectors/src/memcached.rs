//! Memcached text protocol. No credential phase; an answering `version`
//! command is the finding.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct MemcachedConnector;

#[async_trait]
impl Connector for MemcachedConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Memcached
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to memcached at {}", target.addr()));
        let mut stream = match cx.dial(&target.host, target.port).await {
            Ok(s) => s,
            Err(e) => return ProbeReport::from_error(&e),
        };

        if let Err(e) = io::send(&mut stream, b"version\r\n", DEFAULT_IO_TIMEOUT).await {
            return ProbeReport::from_error(&e);
        }
        let version = match io::recv_line(&mut stream, DEFAULT_IO_TIMEOUT).await {
            Ok(line) if line.starts_with("VERSION") => line,
            Ok(line) => {
                return ProbeReport::failed(format!("not a memcached service: {line}"));
            }
            Err(e) => return ProbeReport::from_error(&e),
        };
        cx.log(format!("server answered: {version}"));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "memcached accessible at {}\n{rule}\n{version}\nno authentication required\n",
            target.addr()
        );

        if io::send(&mut stream, b"stats\r\n", DEFAULT_IO_TIMEOUT).await.is_ok() {
            if let Ok(stats) = io::recv_some(&mut stream, DEFAULT_IO_TIMEOUT).await {
                let text = String::from_utf8_lossy(&stats);
                let interesting: Vec<&str> = text
                    .lines()
                    .filter(|l| {
                        l.contains("uptime")
                            || l.contains("curr_items")
                            || l.contains("total_items")
                            || l.contains("curr_connections")
                            || l.contains("bytes")
                            || l.contains("get_hits")
                    })
                    .collect();
                if !interesting.is_empty() {
                    evidence.push_str("\nstats:\n");
                    evidence.push_str(&io::clip_lines(&interesting.join("\n"), 10));
                    evidence.push('\n');
                }
            }
        }

        ProbeReport::success("memcached access verified", evidence)
    }

    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        cx.log(format!("executing memcached command: {command}"));
        let mut stream = cx.dial(&target.host, target.port).await?;
        io::send(&mut stream, format!("{command}\r\n").as_bytes(), DEFAULT_IO_TIMEOUT).await?;
        let reply = io::recv_some(&mut stream, DEFAULT_IO_TIMEOUT).await?;
        Ok(String::from_utf8_lossy(&reply).trim_end().to_string())
    }
}
