//! Discovery HTTP polling: topic → broker node set

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::LookupFailure;
use crate::host_port::HostAndPort;
use crate::types::Topic;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Tolerates both the plain and legacy envelope shapes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupBody {
    Plain {
        producers: Vec<Producer>,
    },
    Legacy {
        #[allow(dead_code)]
        status_code: i64,
        data: LegacyData,
    },
}

#[derive(Debug, Deserialize)]
struct LegacyData {
    producers: Vec<Producer>,
}

impl LookupBody {
    fn into_producers(self) -> Vec<Producer> {
        match self {
            Self::Plain { producers } | Self::Legacy { data: LegacyData { producers }, .. } => {
                producers
            }
        }
    }
}

/// Polls one or more discovery hosts and unions their topic → node mappings
///
/// Per-URL failure counts drive log-level escalation; a non-200 response is
/// deliberately *not* counted as a failure.
#[derive(Debug)]
pub(crate) struct DiscoveryClient {
    http: reqwest::Client,
    hosts: Vec<String>,
    failures: Mutex<HashMap<String, u32>>,
    max_failures_before_error: u32,
}

impl DiscoveryClient {
    pub(crate) fn new(hosts: Vec<String>, max_failures_before_error: u32) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(LOOKUP_TIMEOUT)
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            hosts,
            failures: Mutex::new(HashMap::new()),
            max_failures_before_error: max_failures_before_error.max(1),
        }
    }

    /// Look up the current node set for `topic`, unioning across all hosts
    pub(crate) async fn lookup(&self, topic: &Topic) -> HashSet<HostAndPort> {
        let mut nodes = HashSet::new();
        for host in &self.hosts {
            match self.lookup_one(host, topic).await {
                Ok(Some(producers)) => {
                    self.note_success(host).await;
                    nodes.extend(producers);
                }
                Ok(None) => {
                    // non-200: ignored, not a failure
                }
                Err(err) => {
                    self.note_failure(host, &err).await;
                }
            }
        }
        nodes
    }

    async fn lookup_one(
        &self,
        host: &str,
        topic: &Topic,
    ) -> Result<Option<Vec<HostAndPort>>, LookupFailure> {
        let mut url = url::Url::parse(&format!("{host}/lookup"))
            .unwrap_or_else(|_| url::Url::parse("http://invalid/lookup").unwrap());
        url.query_pairs_mut().append_pair("topic", topic.as_str());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| LookupFailure::Request(host.to_owned(), err))?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|err| LookupFailure::Request(host.to_owned(), err))?;
        let parsed: LookupBody = serde_json::from_str(&body)
            .map_err(|err| LookupFailure::Decode(host.to_owned(), err))?;

        Ok(Some(
            parsed
                .into_producers()
                .into_iter()
                .map(|p| HostAndPort::new(p.broadcast_address, p.tcp_port))
                .collect(),
        ))
    }

    async fn note_success(&self, host: &str) {
        self.failures.lock().await.insert(host.to_owned(), 0);
    }

    async fn note_failure(&self, host: &str, err: &LookupFailure) {
        let mut failures = self.failures.lock().await;
        let count = failures.entry(host.to_owned()).or_insert(0);
        *count += 1;
        if *count >= self.max_failures_before_error {
            error!(host, failures = *count, %err, "discovery lookup failing repeatedly");
        } else {
            warn!(host, failures = *count, %err, "discovery lookup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DiscoveryClient, LookupBody};

    #[test]
    fn parses_plain_envelope() {
        let body: LookupBody =
            serde_json::from_str(r#"{"producers":[{"broadcast_address":"a","tcp_port":4150}]}"#)
                .unwrap();
        assert_eq!(1, body.into_producers().len());
    }

    #[test]
    fn parses_legacy_envelope() {
        let body: LookupBody = serde_json::from_str(
            r#"{"status_code":200,"data":{"producers":[{"broadcast_address":"a","tcp_port":4150}]}}"#,
        )
        .unwrap();
        assert_eq!(1, body.into_producers().len());
    }

    #[tokio::test]
    async fn no_hosts_yields_empty_node_set() {
        let client = DiscoveryClient::new(Vec::new(), 5);
        let topic = crate::types::Topic::new("t").unwrap();
        assert!(client.lookup(&topic).await.is_empty());
    }

    #[tokio::test]
    async fn lookup_unions_producers_across_hosts() {
        let server_a = httpmock::MockServer::start_async().await;
        let mock_a = server_a
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/lookup")
                    .query_param("topic", "orders");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"producers":[{"broadcast_address":"broker-1","tcp_port":4150}]}"#);
            })
            .await;

        let server_b = httpmock::MockServer::start_async().await;
        server_b
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/lookup")
                    .query_param("topic", "orders");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"status_code":200,"data":{"producers":[{"broadcast_address":"broker-2","tcp_port":4151}]}}"#);
            })
            .await;

        let client = DiscoveryClient::new(vec![server_a.base_url(), server_b.base_url()], 5);
        let topic = crate::types::Topic::new("orders").unwrap();
        let nodes = client.lookup(&topic).await;

        mock_a.assert_async().await;
        assert_eq!(2, nodes.len());
        assert!(nodes.contains(&crate::host_port::HostAndPort::new("broker-1", 4150)));
        assert!(nodes.contains(&crate::host_port::HostAndPort::new("broker-2", 4151)));
    }

    #[tokio::test]
    async fn non_200_response_is_ignored_not_counted_as_failure() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/lookup");
                then.status(500);
            })
            .await;

        let client = DiscoveryClient::new(vec![server.base_url()], 1);
        let topic = crate::types::Topic::new("orders").unwrap();
        assert!(client.lookup(&topic).await.is_empty());
        assert!(client.failures.lock().await.is_empty());
    }
}
