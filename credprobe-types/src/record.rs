use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::{Protocol, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Pending => write!(f, "pending"),
            ProbeStatus::Success => write!(f, "success"),
            ProbeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The all-or-nothing result of one probe invocation.
///
/// `status == Success` implies non-empty `evidence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub message: String,
    pub evidence: String,
    pub log: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn success(message: impl Into<String>, evidence: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Success,
            message: message.into(),
            evidence: evidence.into(),
            log: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Failed,
            message: message.into(),
            evidence: String::new(),
            log: Vec::new(),
            completed_at: Utc::now(),
        }
    }
}

/// Durable record of a target and every probe ever run against it.
///
/// `log` and `evidence` are append-only: a re-probe adds a separator (log) or a
/// timestamped banner (evidence) and then its own lines. History is never
/// discarded, so repeated tests of one target stay auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub status: ProbeStatus,
    pub message: String,
    pub evidence: String,
    pub log: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    pub fn new(target: &Target) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol: target.protocol,
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            password: target.password.clone(),
            status: ProbeStatus::Pending,
            message: "awaiting probe".to_string(),
            evidence: String::new(),
            log: Vec::new(),
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.protocol, self.host.clone(), self.port)
            .with_credentials(self.username.clone(), self.password.clone())
    }

    /// Mark the record pending at the start of a probe, separating the new
    /// probe's log lines from previous history.
    pub fn begin_probe(&mut self) {
        self.status = ProbeStatus::Pending;
        self.message = "probe in progress".to_string();
        if !self.log.is_empty() {
            self.log.push(String::new());
            self.log.push("-".repeat(60));
        }
    }

    /// Fold a completed probe into the record, appending (never replacing)
    /// log lines and evidence.
    pub fn apply_outcome(&mut self, outcome: ProbeOutcome) {
        self.status = outcome.status;
        self.message = outcome.message;
        self.log.extend(outcome.log);
        if outcome.status == ProbeStatus::Success {
            self.connected_at = Some(outcome.completed_at);
            self.append_evidence(&outcome.evidence, outcome.completed_at);
        }
    }

    fn append_evidence(&mut self, evidence: &str, at: DateTime<Utc>) {
        if evidence.is_empty() {
            return;
        }
        if self.evidence.is_empty() {
            self.evidence = evidence.to_string();
        } else {
            let rule = "=".repeat(60);
            let stamp = at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
            self.evidence.push_str(&format!(
                "\n\n{rule}\nre-probe at: {stamp}\n{rule}\n\n{evidence}"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConnectionRecord {
        ConnectionRecord::new(&Target::new(Protocol::Redis, "10.0.0.1", 6379))
    }

    #[test]
    fn success_requires_evidence_by_construction() {
        let ok = ProbeOutcome::success("unauthenticated access", "keyspace: db0");
        assert_eq!(ok.status, ProbeStatus::Success);
        assert!(!ok.evidence.is_empty());
    }

    #[test]
    fn reprobe_appends_log_and_evidence() {
        let mut rec = record();

        rec.begin_probe();
        let mut first = ProbeOutcome::success("ok", "evidence one");
        first.log = vec!["[00:00:01] connected".into()];
        rec.apply_outcome(first);

        let log_len_after_first = rec.log.len();
        let evidence_len_after_first = rec.evidence.len();

        rec.begin_probe();
        let mut second = ProbeOutcome::success("ok again", "evidence two");
        second.log = vec!["[00:00:09] connected".into()];
        rec.apply_outcome(second);

        // Log: separator (blank + rule) plus the new line.
        assert_eq!(rec.log.len(), log_len_after_first + 3);
        // Evidence grew by at least the new evidence plus a banner.
        assert!(rec.evidence.len() > evidence_len_after_first + "evidence two".len());
        assert!(rec.evidence.starts_with("evidence one"));
        assert!(rec.evidence.contains("re-probe at:"));
        assert!(rec.evidence.ends_with("evidence two"));
    }

    #[test]
    fn transcript_length_bounds_after_n_probes() {
        let mut rec = record();
        let pieces = ["aaaa", "bbbb", "cccc"];
        for piece in pieces {
            rec.begin_probe();
            rec.apply_outcome(ProbeOutcome::success("ok", piece));
        }
        let total: usize = pieces.iter().map(|p| p.len()).sum();
        // N probes leave N-1 banners between the evidence pieces.
        assert!(rec.evidence.len() >= total + (pieces.len() - 1));
        assert_eq!(rec.evidence.matches("re-probe at:").count(), pieces.len() - 1);
    }

    #[test]
    fn failed_probe_keeps_previous_evidence() {
        let mut rec = record();
        rec.begin_probe();
        rec.apply_outcome(ProbeOutcome::success("ok", "proof"));
        rec.begin_probe();
        rec.apply_outcome(ProbeOutcome::failed("connection refused"));
        assert_eq!(rec.status, ProbeStatus::Failed);
        assert_eq!(rec.evidence, "proof");
        assert_eq!(rec.message, "connection refused");
    }
}
