use async_trait::async_trait;
use credprobe_types::{Protocol, Target};

use crate::{ConnectorError, ProbeContext};

/// Flat result of one probe attempt against one target.
///
/// A successful report carries the evidence transcript; the context holds the
/// timestamped log that accumulated alongside it.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub success: bool,
    pub message: String,
    pub evidence: String,
}

impl ProbeReport {
    pub fn success(message: impl Into<String>, evidence: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            evidence: evidence.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            evidence: String::new(),
        }
    }

    pub fn from_error(err: &ConnectorError) -> Self {
        Self::failed(err.to_string())
    }
}

/// A protocol adapter. Implementations are stateless; everything per-probe
/// flows through `target` and `cx`.
#[async_trait]
pub trait Connector: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Verify access to the target and collect evidence.
    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport;

    /// Execute a protocol-specific command against an already-verified
    /// target. Most protocols have nothing meaningful to run.
    async fn run_command(
        &self,
        target: &Target,
        cx: &ProbeContext,
        command: &str,
    ) -> Result<String, ConnectorError> {
        let _ = (target, cx, command);
        Err(ConnectorError::Unsupported(self.protocol()))
    }
}
