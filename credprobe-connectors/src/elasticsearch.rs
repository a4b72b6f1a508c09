//! Elasticsearch REST probe. An answered root document plus cluster health
//! and a bounded index listing; basic auth only when credentials were
//! supplied.

use std::time::Duration;

use async_trait::async_trait;
use credprobe_types::{Protocol, Target};
use serde_json::Value;

use crate::{Connector, ConnectorError, ProbeContext, ProbeReport};

pub struct ElasticsearchConnector;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

async fn get_json(
    client: &reqwest::Client,
    target: &Target,
    url: &str,
) -> Result<Value, ConnectorError> {
    let mut request = client.get(url);
    if let Some(user) = &target.username {
        request = request.basic_auth(user, target.password.as_deref());
    }
    let response = request
        .send()
        .await
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;
    match response.status().as_u16() {
        200 => response
            .json()
            .await
            .map_err(|e| ConnectorError::Protocol(e.to_string())),
        401 | 403 => Err(ConnectorError::AuthFailed(format!(
            "{} for {url}",
            response.status()
        ))),
        other => Err(ConnectorError::Protocol(format!("http {other} for {url}"))),
    }
}

/// Find the scheme the service actually answers on.
async fn root_document(
    client: &reqwest::Client,
    target: &Target,
    cx: &ProbeContext,
) -> Result<(String, Value), ConnectorError> {
    let mut last = ConnectorError::Connection("no scheme answered".into());
    for scheme in ["http", "https"] {
        let base = format!("{scheme}://{}", target.addr());
        match get_json(client, target, &format!("{base}/")).await {
            Ok(root) => return Ok((base, root)),
            // a 401/403 means the scheme was right; stop probing schemes
            Err(e @ ConnectorError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                cx.log(format!("{scheme} attempt: {e}"));
                last = e;
            }
        }
    }
    Err(last)
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> &'a str {
    let mut v = value;
    for p in path {
        v = &v[p];
    }
    v.as_str().unwrap_or("unknown")
}

#[async_trait]
impl Connector for ElasticsearchConnector {
    fn protocol(&self) -> Protocol {
        Protocol::Elasticsearch
    }

    async fn probe(&self, target: &Target, cx: &ProbeContext) -> ProbeReport {
        cx.log(format!("querying elasticsearch at {}", target.addr()));
        let client = match cx.http_client(HTTP_TIMEOUT) {
            Ok(c) => c,
            Err(e) => return ProbeReport::from_error(&e),
        };

        let (base, root) = match root_document(&client, target, cx).await {
            Ok(pair) => pair,
            Err(e) => return ProbeReport::from_error(&e),
        };
        if root["tagline"].as_str() != Some("You Know, for Search") && root["version"].is_null() {
            return ProbeReport::failed("service answered but is not elasticsearch");
        }
        cx.log(format!(
            "cluster {} answered",
            str_at(&root, &["cluster_name"])
        ));

        let rule = "=".repeat(45);
        let mut evidence = format!(
            "elasticsearch api open at {base}\n{rule}\ncluster: {}\nnode: {}\nversion: {}\n",
            str_at(&root, &["cluster_name"]),
            str_at(&root, &["name"]),
            str_at(&root, &["version", "number"]),
        );

        if let Ok(health) = get_json(&client, target, &format!("{base}/_cluster/health")).await {
            evidence.push_str(&format!(
                "health: {} ({} nodes, {} active shards)\n",
                str_at(&health, &["status"]),
                health["number_of_nodes"].as_u64().unwrap_or(0),
                health["active_shards"].as_u64().unwrap_or(0),
            ));
        }

        let url = format!("{base}/_cat/indices?format=json");
        if let Ok(Value::Array(indices)) = get_json(&client, target, &url).await {
            evidence.push_str(&format!("\nindices ({}):\n", indices.len()));
            for index in indices.iter().take(10) {
                evidence.push_str(&format!(
                    "  {} ({} docs, {})\n",
                    str_at(index, &["index"]),
                    str_at(index, &["docs.count"]),
                    str_at(index, &["store.size"]),
                ));
            }
            if indices.len() > 10 {
                evidence.push_str(&format!("  ... ({} more)\n", indices.len() - 10));
            }
        }

        let how = if target.username.is_some() {
            "supplied credentials"
        } else {
            "no authentication"
        };
        ProbeReport::success(format!("elasticsearch access verified ({how})"), evidence)
    }
}
