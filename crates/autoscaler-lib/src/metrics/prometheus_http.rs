//! Prometheus HTTP API gateway

use super::{MetricsGateway, NetworkUsage, QueryTemplates};
use crate::error::{Error, Result};
use crate::models::MetricSample;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default per-request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Instant-query response envelope
#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    #[allow(dead_code)]
    metric: HashMap<String, String>,
    /// `[timestamp, "value"]`
    #[serde(default)]
    value: Option<Vec<Value>>,
}

/// Gateway issuing instant queries against `<base>/api/v1/query`
pub struct PrometheusGateway {
    client: Client,
    query_endpoint: Url,
    templates: QueryTemplates,
}

impl PrometheusGateway {
    pub fn new(base_url: &str, templates: QueryTemplates) -> Result<Self> {
        Self::with_timeout(base_url, templates, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        templates: QueryTemplates,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = format!("{}/api/v1/query", base_url.trim_end_matches('/'));
        let query_endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("invalid prometheus url '{base_url}': {e}")))?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            query_endpoint,
            templates,
        })
    }

    /// Run one instant query and extract its first sample
    pub async fn query(&self, expr: &str) -> Result<MetricSample> {
        let mut url = self.query_endpoint.clone();
        url.query_pairs_mut().append_pair("query", expr);

        debug!(url = %url, "Querying Prometheus");

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let detail = serde_json::from_str::<QueryResponse>(&body)
                .ok()
                .and_then(|r| r.error);
            return Err(Error::MetricsUnavailable {
                query: expr.to_string(),
                reason: match detail {
                    Some(detail) => format!("HTTP {status}: {detail}"),
                    None => format!("HTTP {status}"),
                },
            });
        }

        parse_sample(&body, expr)
    }
}

/// Interpret an instant-query response body
pub fn parse_sample(body: &str, query: &str) -> Result<MetricSample> {
    let response: QueryResponse = serde_json::from_str(body)
        .map_err(|e| Error::MetricsParse(format!("malformed response body: {e}")))?;

    if response.status != "success" {
        return Err(Error::MetricsUnavailable {
            query: query.to_string(),
            reason: response
                .error
                .unwrap_or_else(|| format!("status '{}'", response.status)),
        });
    }

    let first = response
        .data
        .and_then(|data| data.result.into_iter().next())
        .ok_or_else(|| Error::MetricsUnavailable {
            query: query.to_string(),
            reason: "no data returned".to_string(),
        })?;

    let raw = match first.value.as_deref() {
        Some([_, Value::String(raw)]) => raw.clone(),
        Some(other) => {
            return Err(Error::MetricsParse(format!(
                "unexpected value array: {}",
                Value::Array(other.to_vec())
            )))
        }
        None => return Err(Error::MetricsParse("result has no value".to_string())),
    };

    let value = match raw.as_str() {
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        _ => raw
            .parse::<f64>()
            .ok()
            .filter(|v| !v.is_nan())
            .ok_or_else(|| Error::MetricsParse(format!("'{raw}' is not a number")))?,
    };

    Ok(MetricSample { value })
}

#[async_trait]
impl MetricsGateway for PrometheusGateway {
    async fn fetch_disk_usage_percent(&self, claim_name: &str, namespace: &str) -> Result<f64> {
        let query = self.templates.disk_usage_query(claim_name, namespace);
        Ok(self.query(&query).await?.value)
    }

    async fn fetch_network_usage(
        &self,
        pod_name: &str,
        namespace: &str,
    ) -> Result<NetworkUsage> {
        let ingress_query = self.templates.ingress_query(pod_name, namespace);
        let ingress = self.query(&ingress_query).await?.value;

        let egress_query = self.templates.egress_query(pod_name, namespace);
        let egress = self.query(&egress_query).await.map(|sample| sample.value);

        Ok(NetworkUsage {
            ingress_bytes_per_sec: ingress,
            egress_bytes_per_sec: egress,
        })
    }
}
