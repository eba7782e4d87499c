use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, error, info};

use super::{NodeId, Result, TestbedError};
use crate::config::Credentials;

// Node firmware answers with one of these instead of a payload when it
// could not execute the request.
const NODE_ERROR_PREFIXES: [&str; 3] = ["JUNK-INPUT", "CORRUPTED-DATA", "ERROR"];

/// HTTP client for the ALH communicator that relays requests to a cluster.
pub struct AlhWeb {
    client: Client,
    base_url: String,
    cluster: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
        }
    }
}

impl AlhWeb {
    pub fn new(base_url: &str, cluster: u16, timeout: Duration) -> Result<Self> {
        info!("Initializing ALH communicator client for {} cluster {}", base_url, cluster);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TestbedError::Communication(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url, cluster))
    }

    pub(crate) fn with_client(client: Client, base_url: &str, cluster: u16) -> Self {
        AlhWeb {
            client,
            base_url: base_url.to_string(),
            cluster,
        }
    }

    pub fn cluster(&self) -> u16 {
        self.cluster
    }

    /// Query the coordinator itself. Used to check that the credentials are accepted.
    pub fn hello(&self, credentials: &Credentials) -> Result<String> {
        self.send(credentials, Method::Get, "hello", None, None)
    }

    pub fn node_get(&self, credentials: &Credentials, node: &NodeId, resource: &str) -> Result<String> {
        let resource = node_resource(node.address, resource);
        self.send(credentials, Method::Get, &resource, None, Some(node))
    }

    pub fn node_post(
        &self,
        credentials: &Credentials,
        node: &NodeId,
        resource: &str,
        content: &str,
    ) -> Result<String> {
        let resource = node_resource(node.address, resource);
        self.send(credentials, Method::Post, &resource, Some(content), Some(node))
    }

    fn send(
        &self,
        credentials: &Credentials,
        method: Method,
        resource: &str,
        content: Option<&str>,
        node: Option<&NodeId>,
    ) -> Result<String> {
        info!("ALH {} {} (cluster {})", method.as_str(), resource, self.cluster);

        let cluster = self.cluster.to_string();
        let mut query = vec![
            ("cluster", cluster.as_str()),
            ("method", method.as_str()),
            ("resource", resource),
        ];
        if let Some(content) = content {
            debug!("ALH request content: {}", content);
            query.push(("content", content));
        }

        let response = self
            .client
            .get(self.base_url.as_str())
            .query(&query)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .map_err(|e| {
                error!("ALH request for {} failed: {}", resource, e);
                if e.is_timeout() {
                    TestbedError::Communication(format!("request for {resource} timed out"))
                } else {
                    TestbedError::Communication(format!("request for {resource} failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| TestbedError::Communication(format!("failed to read response for {resource}: {e}")))?;

        classify_response(status, body, resource, node)
    }
}

/// Path of a resource on a node behind the coordinator.
pub fn node_resource(address: u16, resource: &str) -> String {
    format!("nodes?{}/{}", address, resource)
}

fn classify_response(
    status: StatusCode,
    body: String,
    resource: &str,
    node: Option<&NodeId>,
) -> Result<String> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        error!("ALH communicator refused credentials ({})", status);
        return Err(TestbedError::Authorization(format!(
            "communicator returned {status} for {resource}"
        )));
    }
    if !status.is_success() {
        error!("ALH communicator returned {} for {}", status, resource);
        return Err(TestbedError::Communication(format!(
            "communicator returned {status} for {resource}"
        )));
    }

    let body = body.trim().to_string();
    if let Some(prefix) = NODE_ERROR_PREFIXES.iter().find(|p| body.starts_with(*p)) {
        error!("Request {} rejected: {}", resource, body);
        let reason = format!("{resource} rejected with {prefix}: {body}");
        return Err(match node {
            Some(node) => TestbedError::Node { node: *node, reason },
            None => TestbedError::Communication(reason),
        });
    }

    debug!("ALH response for {}: {}", resource, body);
    Ok(body)
}
