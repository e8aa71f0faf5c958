//! HTTP backend for OpenSearch-compatible clusters
//!
//! [`HttpQueryExecutor`] sends DSL queries to `/{index}/_search` and PPL
//! queries to `/_plugins/_ppl`. [`ClusterCpuProbe`] reports the highest CPU
//! percentage among data nodes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use loadramp_core::error::{ExecutorError, ProbeError};
use loadramp_core::executor::{ExecutionOutcome, QueryDescriptor, QueryExecutor, QueryLanguage};
use loadramp_core::health::HealthProbe;
use reqwest::{Method, RequestBuilder};
use serde_json::Value;

use crate::config::BackendSettings;

/// Longest response excerpt kept in an error message
const ERROR_BODY_LIMIT: usize = 200;

/// Shared client, base URL and credentials
#[derive(Clone)]
pub struct Endpoint {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl Endpoint {
    pub fn new(settings: &BackendSettings, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, reqwest::Error> {
        self.request(Method::GET, path)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// Executes plan queries over HTTP
pub struct HttpQueryExecutor {
    endpoint: Endpoint,
}

impl HttpQueryExecutor {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    fn build(&self, query: &QueryDescriptor) -> RequestBuilder {
        match query.language {
            QueryLanguage::Dsl => {
                let index = query.index.as_deref().unwrap_or("_all");
                self.endpoint
                    .request(Method::POST, &format!("{}/_search", index))
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(query.body.clone())
            }
            QueryLanguage::Ppl => self
                .endpoint
                .request(Method::POST, "_plugins/_ppl")
                .json(&serde_json::json!({ "query": query.body })),
        }
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(&self, query: &QueryDescriptor) -> ExecutionOutcome {
        let start = Instant::now();

        let response = match self.build(query).send().await {
            Ok(response) => response,
            Err(e) => return ExecutionOutcome::failure(start.elapsed(), classify(&e)),
        };

        let status = response.status();
        // read the full body so latency covers the whole response
        let body = response.bytes().await;
        let elapsed = start.elapsed();

        match body {
            Ok(_) if status.is_success() => ExecutionOutcome::success(elapsed),
            Ok(bytes) => {
                let excerpt: String = String::from_utf8_lossy(&bytes)
                    .chars()
                    .take(ERROR_BODY_LIMIT)
                    .collect();
                ExecutionOutcome::failure(elapsed, format!("http {}: {}", status.as_u16(), excerpt))
            }
            Err(e) => ExecutionOutcome::failure(elapsed, classify(&e)),
        }
    }

    async fn check_connection(&self) -> Result<String, ExecutorError> {
        let info = self
            .endpoint
            .get_json("/")
            .await
            .map_err(|e| ExecutorError::ConnectionFailed(e.to_string()))?;
        describe_cluster(&info)
    }
}

/// Error label; the part before ':' groups errors in the summary
fn classify(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timeout: {}", err)
    } else if err.is_connect() {
        format!("connection: {}", err)
    } else {
        format!("request: {}", err)
    }
}

fn describe_cluster(info: &Value) -> Result<String, ExecutorError> {
    let version = info["version"]["number"]
        .as_str()
        .ok_or_else(|| ExecutorError::UnexpectedResponse("missing version.number".to_string()))?;
    let cluster = info["cluster_name"].as_str().unwrap_or("unknown");
    let distribution = info["version"]["distribution"].as_str().unwrap_or("opensearch");
    Ok(format!("{} {} - Cluster: {}", distribution, version, cluster))
}

/// Highest CPU percent across data nodes
pub struct ClusterCpuProbe {
    endpoint: Endpoint,
}

impl ClusterCpuProbe {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl HealthProbe for ClusterCpuProbe {
    fn name(&self) -> &str {
        "cluster data-node CPU"
    }

    async fn sample(&self) -> Result<f64, ProbeError> {
        let info = self
            .endpoint
            .get_json("_nodes")
            .await
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        let stats = self
            .endpoint
            .get_json("_nodes/stats/os")
            .await
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        max_data_node_cpu(&info, &stats)
    }
}

fn max_data_node_cpu(info: &Value, stats: &Value) -> Result<f64, ProbeError> {
    let nodes = stats["nodes"]
        .as_object()
        .ok_or_else(|| ProbeError::Malformed("node stats without a nodes map".to_string()))?;

    let cpu = nodes
        .iter()
        .filter(|(id, _)| {
            info["nodes"][id.as_str()]["roles"]
                .as_array()
                .map_or(false, |roles| roles.iter().any(|r| r == "data"))
        })
        .filter_map(|(_, node)| node["os"]["cpu"]["percent"].as_f64())
        .fold(None, |max: Option<f64>, cpu| Some(max.map_or(cpu, |m| m.max(cpu))));

    cpu.ok_or_else(|| ProbeError::Malformed("no data nodes reported CPU".to_string()))
}
