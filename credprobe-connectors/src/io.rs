//! Timed read/write helpers shared by the raw-socket adapters.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::ConnectorError;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(8);

const MAX_READ: usize = 64 * 1024;

pub async fn send(stream: &mut TcpStream, buf: &[u8], timeout: Duration) -> Result<(), ConnectorError> {
    tokio::time::timeout(timeout, stream.write_all(buf))
        .await
        .map_err(|_| ConnectorError::Timeout)??;
    Ok(())
}

/// One read of whatever the server has, up to 64 KiB. Returns the bytes read;
/// empty means the peer closed.
pub async fn recv_some(stream: &mut TcpStream, timeout: Duration) -> Result<Vec<u8>, ConnectorError> {
    let mut buf = vec![0u8; MAX_READ];
    let n = tokio::time::timeout(timeout, stream.read(&mut buf))
        .await
        .map_err(|_| ConnectorError::Timeout)??;
    buf.truncate(n);
    Ok(buf)
}

pub async fn recv_exact(
    stream: &mut TcpStream,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, ConnectorError> {
    if len > MAX_READ {
        return Err(ConnectorError::Protocol(format!(
            "peer announced oversized frame ({len} bytes)"
        )));
    }
    let mut buf = vec![0u8; len];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .map_err(|_| ConnectorError::Timeout)??;
    Ok(buf)
}

/// Read until CRLF (or LF), returning the line without the terminator.
pub async fn recv_line(stream: &mut TcpStream, timeout: Duration) -> Result<String, ConnectorError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = tokio::time::timeout(timeout, stream.read(&mut byte))
            .await
            .map_err(|_| ConnectorError::Timeout)??;
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
        if line.len() > 4096 {
            return Err(ConnectorError::Protocol("line too long".to_string()));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Keep at most `limit` lines, appending a marker when more were available.
pub fn clip_lines(text: &str, limit: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= limit {
        text.trim_end().to_string()
    } else {
        let mut out = lines[..limit].join("\n");
        out.push_str(&format!("\n... ({} more lines)", lines.len() - limit));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_short_text_intact() {
        assert_eq!(clip_lines("a\nb", 10), "a\nb");
    }

    #[test]
    fn clip_appends_remainder_marker() {
        let text = (0..15).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let clipped = clip_lines(&text, 10);
        assert!(clipped.ends_with("... (5 more lines)"));
        assert_eq!(clipped.lines().count(), 11);
    }
}
