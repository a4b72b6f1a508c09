use std::sync::Arc;

use credprobe_connectors::{ConnectorError, ProbeContext};
use credprobe_db::{DbError, RecordStore};
use credprobe_types::{ConnectionRecord, ProbeOutcome, ProxyConfig, Target};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("task join error: {0}")]
    TaskJoin(String),
}

/// Probe orchestrator. Owns nothing global: the store, the proxy surface and
/// the connector registry are explicit dependencies.
///
/// Concurrent re-probes of the same record id are not serialized here; the
/// caller decides whether that is sensible.
pub struct ProbeEngine {
    store: Arc<dyn RecordStore>,
    proxy: Option<ProxyConfig>,
    registry: Registry,
}

impl ProbeEngine {
    pub fn new(store: Arc<dyn RecordStore>, proxy: Option<ProxyConfig>) -> Self {
        Self {
            store,
            proxy,
            registry: Registry,
        }
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    /// Startup housekeeping: probes interrupted by a previous shutdown are
    /// still marked pending and will never complete.
    pub fn reset_interrupted(&self) -> Result<usize, EngineError> {
        let reset = self.store.reset_all_pending()?;
        if reset > 0 {
            warn!(count = reset, "marked interrupted probes as failed");
        }
        Ok(reset)
    }

    /// Persist a new target as a pending record.
    pub fn add_target(&self, target: &Target) -> Result<ConnectionRecord, EngineError> {
        let record = ConnectionRecord::new(target);
        self.store.upsert(&record)?;
        Ok(record)
    }

    /// Run one probe end to end: pending upsert, adapter, terminal upsert.
    pub async fn probe_record(&self, id: &str) -> Result<ConnectionRecord, EngineError> {
        let mut record = self.store.get(id)?;
        record.begin_probe();
        self.store.upsert(&record)?;

        let target = record.target();
        let connector = self.registry.connector(record.protocol);
        let cx = ProbeContext::new(self.proxy.clone());
        info!(protocol = %record.protocol, target = %target.addr(), "probe started");

        let report = connector.probe(&target, &cx).await;
        let mut outcome = if report.success {
            ProbeOutcome::success(report.message, report.evidence)
        } else {
            ProbeOutcome::failed(report.message)
        };
        outcome.log = cx.take_log();

        info!(
            protocol = %record.protocol,
            target = %target.addr(),
            status = %outcome.status,
            "probe finished"
        );
        record.apply_outcome(outcome);
        self.store.upsert(&record)?;
        Ok(record)
    }

    /// Fan a batch out, one task per record, no cross-waiting. Results come
    /// back in completion order.
    pub async fn probe_batch(
        self: &Arc<Self>,
        ids: Vec<String>,
    ) -> Vec<(String, Result<ConnectionRecord, EngineError>)> {
        let mut set = JoinSet::new();
        for id in ids {
            let engine = Arc::clone(self);
            set.spawn(async move {
                let result = engine.probe_record(&id).await;
                (id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => results.push((String::new(), Err(EngineError::TaskJoin(e.to_string())))),
            }
        }
        results
    }

    /// Execute a protocol command against a stored target. The command's
    /// attempt narrative is appended to the record's log.
    pub async fn run_command(&self, id: &str, command: &str) -> Result<String, EngineError> {
        let mut record = self.store.get(id)?;
        let target = record.target();
        let connector = self.registry.connector(record.protocol);
        let cx = ProbeContext::new(self.proxy.clone());

        let result = connector.run_command(&target, &cx, command).await;
        let lines = cx.take_log();
        if !lines.is_empty() {
            record.log.extend(lines);
            self.store.upsert(&record)?;
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credprobe_db::SqliteStore;
    use credprobe_types::{ProbeStatus, Protocol};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn engine() -> Arc<ProbeEngine> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Arc::new(ProbeEngine::new(store, None))
    }

    #[tokio::test]
    async fn failed_probe_reaches_terminal_state_with_log() {
        let engine = engine();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener); // nothing is listening

        let target = Target::new(Protocol::Redis, "127.0.0.1", port);
        let record = engine.add_target(&target).unwrap();
        let probed = engine.probe_record(&record.id).await.unwrap();

        assert_eq!(probed.status, ProbeStatus::Failed);
        assert!(!probed.log.is_empty(), "probe log should carry the narrative");
        assert!(probed.evidence.is_empty());
        // terminal state is persisted
        assert_eq!(
            engine.store().get(&record.id).unwrap().status,
            ProbeStatus::Failed
        );
    }

    #[tokio::test]
    async fn successful_probe_persists_evidence() {
        let engine = engine();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // minimal redis: PONG, then bulk replies until the client quits
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let req = String::from_utf8_lossy(&buf[..n]).to_uppercase();
                let reply: &[u8] = if req.contains("PING") {
                    b"+PONG\r\n"
                } else if req.contains("INFO") {
                    b"+# Keyspace\r\n"
                } else if req.contains("CONFIG") {
                    b"*2\r\n$9\r\ndatabases\r\n$2\r\n16\r\n"
                } else if req.contains("DBSIZE") {
                    b":0\r\n"
                } else {
                    b"+OK\r\n"
                };
                if stream.write_all(reply).await.is_err() {
                    return;
                }
            }
        });

        let target = Target::new(Protocol::Redis, "127.0.0.1", port);
        let record = engine.add_target(&target).unwrap();
        let probed = engine.probe_record(&record.id).await.unwrap();

        assert_eq!(probed.status, ProbeStatus::Success, "{}", probed.message);
        assert!(!probed.evidence.is_empty());
        assert!(probed.connected_at.is_some());
    }

    #[tokio::test]
    async fn batch_returns_one_result_per_id() {
        let engine = engine();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            let record = engine
                .add_target(&Target::new(Protocol::Memcached, "127.0.0.1", port))
                .unwrap();
            ids.push(record.id);
        }

        let results = engine.probe_batch(ids.clone()).await;
        assert_eq!(results.len(), 3);
        for (id, result) in results {
            assert!(ids.contains(&id));
            assert_eq!(result.unwrap().status, ProbeStatus::Failed);
        }
    }

    #[tokio::test]
    async fn unknown_record_is_a_db_error() {
        let engine = engine();
        match engine.probe_record("missing").await {
            Err(EngineError::Db(DbError::NotFound(_))) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
