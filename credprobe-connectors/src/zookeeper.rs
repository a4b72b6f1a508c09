//! ZooKeeper four-letter-word admin commands. Each word gets its own
//! connection; the server closes after answering.

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::io::{self, DEFAULT_IO_TIMEOUT};
use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct ZookeeperConnector;

async fn four_letter(
    target: &Target,
    cx: &ProbeContext,
    word: &str,
) -> Result<String, ConnectorError> {
    let mut stream = cx.dial(&target.host, target.port).await?;
    io::send(&mut stream, word.as_bytes(), DEFAULT_IO_TIMEOUT).await?;
    let mut reply = Vec::new();
    loop {
        let chunk = io::recv_some(&mut stream, DEFAULT_IO_TIMEOUT).await?;
        if chunk.is_empty() {
            break;
        }
        reply.extend_from_slice(&chunk);
        if reply.len() > 32 * 1024 {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&reply).trim_end().to_string())
}

#[async_trait]
impl Connector for ZookeeperConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Zookeeper
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("connecting to zookeeper at {}", target.addr()));

        let ruok = match four_letter(target, cx, "ruok").await {
            Ok(r) => r,
            Err(e) => return ProbeReport::from_error(&e),
        };
        if ruok != "imok" {
            // ruok may be whitelisted off; stat still proves exposure
            cx.log(format!("ruok answered {:?}, trying stat", ruok));
        } else {
            cx.log("server answered imok");
        }

        let stat = four_letter(target, cx, "stat").await.unwrap_or_default();
        if ruok != "imok" && !stat.contains("Zookeeper version") {
            return ProbeReport::failed("not a zookeeper service (ruok and stat both refused)");
        }

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "zookeeper admin commands exposed at {}\n{rule}\n",
            target.addr()
        );
        if ruok == "imok" {
            evidence.push_str("ruok: imok\n");
        }
        if !stat.is_empty() {
            evidence.push_str("\nstat:\n");
            evidence.push_str(&io::clip_lines(&stat, 10));
            evidence.push('\n');
        }
        if let Ok(envi) = four_letter(target, cx, "envi").await {
            if !envi.is_empty() {
                evidence.push_str("\nenvi:\n");
                evidence.push_str(&io::clip_lines(&envi, 10));
                evidence.push('\n');
            }
        }

        ProbeReport::success("zookeeper access verified", evidence)
    }

    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        let word = command.trim();
        if word.len() != 4 || !word.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(ConnectorError::Protocol(format!(
                "zookeeper commands are four lowercase letters, got {word:?}"
            )));
        }
        cx.log(format!("sending four-letter word: {word}"));
        four_letter(target, cx, word).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn mock_zk(listener: TcpListener) {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let reply = match &buf[..n] {
                b"ruok" => "imok".to_string(),
                b"stat" => "Zookeeper version: 3.8.0\nMode: standalone\n".to_string(),
                b"envi" => "Environment:\nzookeeper.version=3.8.0\n".to_string(),
                _ => String::new(),
            };
            let _ = stream.write_all(reply.as_bytes()).await;
            // server closes after each answer
        }
    }

    #[tokio::test]
    async fn four_letter_words_build_evidence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(mock_zk(listener));

        let target = Target::new(Protocol::Zookeeper, "127.0.0.1", port);
        let cx = ProbeContext::new(None);
        let report = ZookeeperConnector.probe(&target, &cx).await;
        assert!(report.success);
        assert!(report.evidence.contains("ruok: imok"));
        assert!(report.evidence.contains("Zookeeper version: 3.8.0"));
    }

    #[tokio::test]
    async fn run_command_rejects_non_four_letter_words() {
        let target = Target::new(Protocol::Zookeeper, "127.0.0.1", 2181);
        let cx = ProbeContext::new(None);
        let err = ZookeeperConnector
            .run_command(&target, &cx, "status")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Protocol(_)));
    }
}
