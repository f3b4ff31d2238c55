//! Fan-out of journal commands to the configured resources.
//!
//! The callback channel is the true completion channel: a 2xx dispatch sets
//! up a future callback, every other outcome synthesizes the terminal event
//! for that slot immediately. This keeps the expected total equal to the
//! resource count for the whole run.

use crate::errors::AggregatorError;
use crate::protocol::{
    CallbackStatus, CorrelationId, DirectJournalRequest, JournalCallback, JournalCommand,
};
use crate::registry::CorrelationRegistry;
use crate::service;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::timeout;
use url::Url;

/// Outcome of one dispatch call, before translation into events.
#[derive(Clone, Debug, PartialEq, Eq)]
enum DispatchOutcome {
    /// Resource accepted; a real callback will arrive later.
    Accepted,
    /// Business rejection (HTTP 401); replaces the expected callback.
    Rejected,
    Timeout,
    ConnectionClosed,
    Failed,
}

impl DispatchOutcome {
    fn synthetic_status(&self) -> Option<CallbackStatus> {
        match self {
            DispatchOutcome::Accepted => None,
            DispatchOutcome::Rejected => Some(CallbackStatus::Rejected),
            DispatchOutcome::Timeout => Some(CallbackStatus::Timeout),
            DispatchOutcome::ConnectionClosed => Some(CallbackStatus::ConnectionClosed),
            DispatchOutcome::Failed => Some(CallbackStatus::Error),
        }
    }
}

/// Parses the comma-separated delay list into exactly `slots` entries.
/// Missing or malformed entries default to 0.
pub fn parse_delays(raw: Option<&str>, slots: usize) -> Vec<i64> {
    let parsed: Vec<i64> = raw
        .unwrap_or("")
        .split(',')
        .map(|entry| entry.trim().parse().unwrap_or(0))
        .collect();

    (0..slots).map(|i| parsed.get(i).copied().unwrap_or(0)).collect()
}

#[derive(Clone)]
pub struct Dispatcher {
    client: Client<HttpConnector, Full<Bytes>>,
    callback_url: String,
    resource_urls: Arc<Vec<Url>>,
}

impl Dispatcher {
    pub fn new(callback_url: String, resource_urls: Vec<Url>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            callback_url,
            resource_urls: Arc::new(resource_urls),
        }
    }

    /// Number of dispatches per aggregation: one per configured resource.
    pub fn slot_count(&self) -> usize {
        self.resource_urls.len()
    }

    /// Starts the dispatch group and returns its cancellation capability.
    /// Aborting the returned handle drops the JoinSet, which aborts every
    /// in-flight resource call.
    pub fn dispatch(
        &self,
        registry: Arc<CorrelationRegistry>,
        correlation_id: CorrelationId,
        patient_id: String,
        delays: Vec<i64>,
        transport_timeout: Duration,
    ) -> AbortHandle {
        let client = self.client.clone();
        let callback_url = self.callback_url.clone();
        let resource_urls = self.resource_urls.clone();

        let supervisor = tokio::spawn(async move {
            let mut join_set = JoinSet::new();

            for (i, delay) in delays.into_iter().enumerate() {
                let url = resource_urls[i % resource_urls.len()].clone();
                let command = JournalCommand {
                    patient_id: patient_id.clone(),
                    delay,
                    callback_url: callback_url.clone(),
                    correlation_id: correlation_id.clone(),
                };
                let client = client.clone();

                tracing::info!(
                    correlation_id = %command.correlation_id,
                    resource = %url,
                    delay,
                    "dispatching to resource"
                );

                join_set.spawn(async move {
                    let source = source_name(&url);
                    let outcome = call_resource(&client, &url, &command, transport_timeout).await;
                    (source, outcome)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((source, outcome)) => {
                        if let Some(status) = outcome.synthetic_status() {
                            tracing::info!(
                                correlation_id = %correlation_id,
                                source = %source,
                                status = ?status,
                                "dispatch completed slot with synthetic event"
                            );
                            let event = JournalCallback::synthetic(
                                source,
                                Some(patient_id.clone()),
                                correlation_id.clone(),
                                status,
                            );
                            service::deliver(&registry, &correlation_id, event).await;
                        }
                    }
                    Err(e) if e.is_panic() => {
                        tracing::error!(error = %e, "dispatch task panicked");
                    }
                    Err(_) => {}
                }
            }
        });

        supervisor.abort_handle()
    }

    /// Synchronous variant: calls every resource's direct endpoint and
    /// returns the full callbacks in arrival order. Used by the
    /// WAIT_FOR_EVERYONE strategy; bypasses the registry entirely.
    pub async fn direct_fan_out(
        &self,
        patient_id: &str,
        delays: Vec<i64>,
        transport_timeout: Duration,
    ) -> Vec<JournalCallback> {
        let mut join_set = JoinSet::new();

        for (i, delay) in delays.into_iter().enumerate() {
            let url = self.resource_urls[i % self.resource_urls.len()].clone();
            let request = DirectJournalRequest {
                patient_id: patient_id.to_string(),
                delay,
            };
            let client = self.client.clone();

            join_set.spawn(async move {
                call_resource_direct(&client, &url, &request, transport_timeout).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(callback) => results.push(callback),
                Err(e) if e.is_panic() => {
                    tracing::error!(error = %e, "direct dispatch task panicked");
                }
                Err(_) => {}
            }
        }
        results
    }
}

fn source_name(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

fn endpoint(base: &Url, path: &str) -> Result<hyper::Uri, AggregatorError> {
    let mut url = base.clone();
    url.set_path(path);
    url.as_str()
        .parse()
        .map_err(|e| AggregatorError::ResourceRequestFailed(source_name(base), format!("{e}")))
}

fn json_request<T: serde::Serialize>(
    uri: hyper::Uri,
    body: &T,
) -> Result<Request<Full<Bytes>>, AggregatorError> {
    let bytes = serde_json::to_vec(body)?;
    Request::builder()
        .method(hyper::Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .map_err(|e| AggregatorError::ResourceRequestFailed(String::new(), format!("{e}")))
}

async fn call_resource(
    client: &Client<HttpConnector, Full<Bytes>>,
    url: &Url,
    command: &JournalCommand,
    transport_timeout: Duration,
) -> DispatchOutcome {
    let request = match endpoint(url, "/journals").and_then(|uri| json_request(uri, command)) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(resource = %url, error = %e, "failed to build dispatch request");
            return DispatchOutcome::Failed;
        }
    };

    match timeout(transport_timeout, client.request(request)).await {
        Ok(Ok(response)) => translate_status(url, response.status()),
        Ok(Err(e)) => {
            let outcome = classify_client_error(&e);
            tracing::warn!(resource = %url, error = %e, outcome = ?outcome, "dispatch failed");
            outcome
        }
        Err(_) => {
            tracing::warn!(
                resource = %url,
                timeout_ms = transport_timeout.as_millis() as u64,
                "dispatch timed out"
            );
            DispatchOutcome::Timeout
        }
    }
}

fn translate_status(url: &Url, status: StatusCode) -> DispatchOutcome {
    if status.is_success() {
        tracing::info!(resource = %url, %status, "resource accepted, callback pending");
        DispatchOutcome::Accepted
    } else if status == StatusCode::UNAUTHORIZED {
        tracing::info!(resource = %url, "resource rejected the request");
        DispatchOutcome::Rejected
    } else {
        tracing::warn!(resource = %url, %status, "resource answered with an error status");
        DispatchOutcome::Failed
    }
}

/// Walks the error chain to tell a peer hangup apart from other transport
/// failures.
fn classify_client_error(err: &(dyn std::error::Error + 'static)) -> DispatchOutcome {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            )
        {
            return DispatchOutcome::ConnectionClosed;
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>()
            && h.is_incomplete_message()
        {
            return DispatchOutcome::ConnectionClosed;
        }
        source = e.source();
    }
    DispatchOutcome::Failed
}

async fn call_resource_direct(
    client: &Client<HttpConnector, Full<Bytes>>,
    url: &Url,
    request: &DirectJournalRequest,
    transport_timeout: Duration,
) -> JournalCallback {
    let source = source_name(url);
    let synthetic = |status| {
        JournalCallback {
            source: source.clone(),
            patient_id: Some(request.patient_id.clone()),
            correlation_id: None,
            status,
            notes: None,
            respondents: None,
            errors: None,
        }
    };

    let http_request = match endpoint(url, "/journals/direct").and_then(|uri| json_request(uri, request))
    {
        Ok(http_request) => http_request,
        Err(e) => {
            tracing::error!(resource = %url, error = %e, "failed to build direct request");
            return synthetic(CallbackStatus::Error);
        }
    };

    let response = match timeout(transport_timeout, client.request(http_request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let status = match classify_client_error(&e) {
                DispatchOutcome::ConnectionClosed => CallbackStatus::ConnectionClosed,
                _ => CallbackStatus::Error,
            };
            tracing::warn!(resource = %url, error = %e, "direct call failed");
            return synthetic(status);
        }
        Err(_) => {
            tracing::warn!(resource = %url, "direct call timed out");
            return synthetic(CallbackStatus::Timeout);
        }
    };

    match translate_status(url, response.status()) {
        DispatchOutcome::Accepted => {}
        DispatchOutcome::Rejected => return synthetic(CallbackStatus::Rejected),
        _ => return synthetic(CallbackStatus::Error),
    }

    let bytes = match response.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(resource = %url, error = %e, "failed to read direct response body");
            return synthetic(CallbackStatus::Error);
        }
    };

    match serde_json::from_slice::<JournalCallback>(&bytes) {
        Ok(callback) => callback,
        Err(e) => {
            tracing::warn!(resource = %url, error = %e, "direct response was not a callback");
            synthetic(CallbackStatus::Error)
        }
    }
}
