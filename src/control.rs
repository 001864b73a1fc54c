use crate::config::ServerConfig;
use crate::error::{is_empty_record_message, Error, Result};
use crate::model::{Node, PeerList, RegisterRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// The control plane as seen by the agent. Every call is a single attempt;
/// retrying is left to whoever schedules the next pass.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn register_node(&self, request: &RegisterRequest) -> Result<Node>;

    /// Canonical server-side view of this node.
    async fn read_node(&self, node_id: &str, network: &str) -> Result<Node>;

    async fn fetch_peers(&self, node_id: &str, network: &str) -> Result<PeerList>;

    async fn deregister_node(&self, node_id: &str, network: &str) -> Result<()>;
}

pub struct ControlClient {
    base_urls: Vec<String>,
    client: reqwest::Client,
    next_index: AtomicUsize,
    access_key: Option<String>,
}

impl ControlClient {
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let base_urls = normalize_base_urls(server.control_urls.clone());
        if base_urls.is_empty() {
            return Err(Error::Config("no control URL configured".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::Control(format!("failed to build http client: {err}")))?;
        Ok(Self {
            base_urls,
            client,
            next_index: AtomicUsize::new(0),
            access_key: server.access_key.clone(),
        })
    }

    /// Try each control URL once, starting from the last one that answered.
    async fn send_with_failover<F>(&self, resend: Resend, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let total = self.base_urls.len();
        let start = self.next_index.load(Ordering::Relaxed) % total;
        let mut last_err: Option<Error> = None;

        for offset in 0..total {
            let index = (start + offset) % total;
            let base = &self.base_urls[index];
            let request = with_bearer(build(&self.client, base), self.access_key.as_deref());
            match request.send().await {
                Ok(resp) => {
                    if resp.status().is_server_error() {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        if is_empty_record_message(&body) {
                            return Err(Error::EmptyRecord(body));
                        }
                        let err = Error::Control(format!("control {} returned {}", base, status));
                        if resend == Resend::OnConnectFailure {
                            return Err(err);
                        }
                        last_err = Some(err);
                        continue;
                    }
                    self.next_index.store(index, Ordering::Relaxed);
                    return Ok(resp);
                }
                Err(err) => {
                    if resend.allows(&err) {
                        debug!(control = %base, error = %err, "control request failed, trying next");
                        last_err = Some(Error::Control(format!(
                            "control {} request failed: {}",
                            base, err
                        )));
                        continue;
                    }
                    return Err(Error::Control(format!(
                        "control {} request failed: {}",
                        base, err
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Control("no control servers available".to_string())))
    }

    fn endpoint_at(base: &str, path: &str) -> String {
        let base = base.trim_end_matches('/');
        format!("{}{}", base, path)
    }
}

#[async_trait]
impl ControlPlane for ControlClient {
    async fn register_node(&self, request: &RegisterRequest) -> Result<Node> {
        let path = format!("/api/nodes/{}", request.node.network);
        let response = self
            .send_with_failover(Resend::OnConnectFailure, |client, base| {
                client.post(Self::endpoint_at(base, &path)).json(request)
            })
            .await?;
        decode_response(response, "register node").await
    }

    async fn read_node(&self, node_id: &str, network: &str) -> Result<Node> {
        let path = format!("/api/nodes/{}/{}", network, node_id);
        let response = self
            .send_with_failover(Resend::Safe, |client, base| client.get(Self::endpoint_at(base, &path)))
            .await?;
        decode_response(response, "read node").await
    }

    async fn fetch_peers(&self, node_id: &str, network: &str) -> Result<PeerList> {
        let path = format!("/api/nodes/{}/{}/peers", network, node_id);
        let response = self
            .send_with_failover(Resend::Safe, |client, base| client.get(Self::endpoint_at(base, &path)))
            .await?;
        decode_response(response, "fetch peers").await
    }

    async fn deregister_node(&self, node_id: &str, network: &str) -> Result<()> {
        let path = format!("/api/nodes/{}/{}", network, node_id);
        let response = self
            .send_with_failover(Resend::Safe, |client, base| client.delete(Self::endpoint_at(base, &path)))
            .await?;
        check_status(response, "deregister node").await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body, what))
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    let response = check_status(response, what).await?;
    response
        .json()
        .await
        .map_err(|err| Error::Control(format!("{what}: invalid response body: {err}")))
}

/// A 404 or a "no records" body means the control plane simply has nothing for
/// this node; anything else is a transport-level failure.
fn classify_failure(status: StatusCode, body: &str, what: &str) -> Error {
    if status == StatusCode::NOT_FOUND || is_empty_record_message(body) {
        let detail = if body.trim().is_empty() {
            format!("{what}: {status}")
        } else {
            format!("{what}: {}", body.trim())
        };
        return Error::EmptyRecord(detail);
    }
    Error::Control(format!("{what} failed with {status}: {}", body.trim()))
}

fn normalize_base_urls(urls: Vec<String>) -> Vec<String> {
    let mut unique = Vec::new();
    for url in urls {
        let trimmed = url.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }
        if !unique.contains(&trimmed) {
            unique.push(trimmed);
        }
    }
    unique
}

/// When a failed request may go to the next control URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resend {
    /// Reads and deletes: transport failures and 5xx answers move on.
    Safe,
    /// Registration: only a connection that never opened moves on.
    OnConnectFailure,
}

impl Resend {
    fn allows(self, err: &reqwest::Error) -> bool {
        match self {
            Resend::Safe => err.is_connect() || err.is_timeout() || err.is_request(),
            Resend::OnConnectFailure => err.is_connect(),
        }
    }
}

fn with_bearer(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    if let Some(token) = token {
        request.bearer_auth(token)
    } else {
        request
    }
}
