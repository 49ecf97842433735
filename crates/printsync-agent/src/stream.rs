//! Camera stream signalling relay.
//!
//! Signalling payloads are passed to the local camera streamer as-is and
//! its JSON answer is handed back to the remote client.

use std::time::Duration;

use async_trait::async_trait;
use printsync_protocol::StreamSignal;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::time::timeout;

use crate::error::AgentError;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[async_trait]
pub trait StreamSignaler: Send + Sync {
    async fn signal(&self, signal: StreamSignal, payload: &Value) -> Result<Value, AgentError>;
}

pub struct HttpStreamSignaler {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpStreamSignaler {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, AgentError> {
        Ok(Self {
            client: Client::builder().timeout(request_timeout).build()?,
            url: url.into(),
            timeout: request_timeout,
        })
    }
}

/// Body posted to the streamer for one signalling step.
pub fn signal_body(signal: StreamSignal, payload: &Value) -> Value {
    match signal {
        StreamSignal::Request => json!({
            "type": "request",
            "res": null,
            "iceServers": [{ "urls": [STUN_SERVER] }],
        }),
        StreamSignal::Candidate | StreamSignal::Offer => payload.clone(),
    }
}

#[async_trait]
impl StreamSignaler for HttpStreamSignaler {
    async fn signal(&self, signal: StreamSignal, payload: &Value) -> Result<Value, AgentError> {
        let request = self
            .client
            .post(&self.url)
            .json(&signal_body(signal, payload))
            .send();
        let response = timeout(self.timeout, request)
            .await
            .map_err(|_| AgentError::Timeout(format!("stream {}", signal.as_str())))??;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status {
                context: format!("stream {}", signal.as_str()),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

/// User-facing error text for a failed signalling step.
pub fn failure_message(signal: StreamSignal) -> &'static str {
    match signal {
        StreamSignal::Request => "Stream request failed: could not reach the camera streamer.",
        StreamSignal::Candidate => "Stream handshake failed: could not reach the camera streamer.",
        StreamSignal::Offer => "Stream connection failed: could not reach the camera streamer.",
    }
}
