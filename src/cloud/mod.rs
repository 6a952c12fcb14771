//! Network-server bridge
//!
//! Pure adapter between MAC frames and the TTN-style gateway-server REST
//! contract, plus the background task that gives HTTP its own cadence. The
//! supervisor never waits on the network: uplinks go through a bounded
//! drop-oldest queue inside the bridge task, downlinks come back over a
//! channel drained during the tick.
//!
//! Contract: `POST {base}/gs/gateways/{id}/packages` with
//! `{"gateway_id", "payload": base64}` under a bearer key; success is the
//! presence of a `success` member in the response body.
//! `GET {base}/gs/gateways/{id}/packages/down` yields a JSON array of
//! base64-encoded frames. Both calls are bounded by a 5 s timeout.

use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CloudConfig;
use crate::error::GatewayError;

const HTTP_TIMEOUT: Duration = Duration::from_millis(5000);
/// Submissions attempted per poll cycle, so one slow flush cannot starve the
/// downlink poll.
const MAX_FLUSH_PER_CYCLE: usize = 8;

pub struct CloudClient {
    http: Client,
    base_url: String,
    api_key: String,
    gateway_id: String,
}

impl CloudClient {
    pub fn new(config: &CloudConfig, gateway_id: &str) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            gateway_id: gateway_id.to_string(),
        }
    }

    /// Submit one uplink frame. Any transport failure, non-2xx status, or
    /// out-of-contract body maps to `CloudUnavailable`.
    pub async fn submit_uplink(&self, frame: &[u8]) -> Result<(), GatewayError> {
        let url = format!("{}/gs/gateways/{}/packages", self.base_url, self.gateway_id);
        let body = json!({
            "gateway_id": self.gateway_id,
            "payload": base64::engine::general_purpose::STANDARD.encode(frame),
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::CloudUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::CloudUnavailable(format!("status {status}")));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::CloudUnavailable(e.to_string()))?;
        if value.get("success").is_none() {
            return Err(GatewayError::CloudUnavailable(
                "response missing success marker".to_string(),
            ));
        }

        debug!(bytes = frame.len(), "uplink submitted");
        Ok(())
    }

    /// Fetch queued downlink frames. Entries that fail base64 decoding are
    /// skipped rather than failing the whole poll.
    pub async fn poll_downlinks(&self) -> Result<Vec<Vec<u8>>, GatewayError> {
        let url = format!("{}/gs/gateways/{}/packages/down", self.base_url, self.gateway_id);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::CloudUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::CloudUnavailable(format!("status {status}")));
        }

        let encoded: Vec<String> = resp
            .json()
            .await
            .map_err(|e| GatewayError::CloudUnavailable(e.to_string()))?;

        let mut frames = Vec::with_capacity(encoded.len());
        for entry in encoded {
            match base64::engine::general_purpose::STANDARD.decode(&entry) {
                Ok(bytes) => frames.push(bytes),
                Err(e) => warn!("discarding malformed downlink entry: {}", e),
            }
        }
        Ok(frames)
    }
}

/// Bounded uplink retry buffer. When the network server is unreachable the
/// newest frames win: the oldest queued frame is dropped to make room.
#[derive(Debug)]
pub struct UplinkQueue {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
    dropped: u64,
}

impl UplinkQueue {
    pub fn new(capacity: usize) -> Self {
        Self { frames: VecDeque::with_capacity(capacity), capacity: capacity.max(1), dropped: 0 }
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
            warn!(dropped_total = self.dropped, "uplink queue full, oldest frame dropped");
        }
        self.frames.push_back(frame);
    }

    pub fn front(&self) -> Option<&Vec<u8>> {
        self.frames.front()
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Background bridge: absorbs uplinks from the supervisor, flushes them on
/// its own cadence, and feeds polled downlinks back. Exits when the
/// supervisor side of the channel closes.
pub async fn bridge_task(
    client: CloudClient,
    mut uplink_rx: mpsc::Receiver<Vec<u8>>,
    downlink_tx: mpsc::Sender<Vec<u8>>,
    poll_interval_ms: u64,
    queue_capacity: usize,
) {
    let mut queue = UplinkQueue::new(queue_capacity);
    let mut cadence = tokio::time::interval(Duration::from_millis(poll_interval_ms.max(100)));
    cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("cloud bridge running");
    loop {
        tokio::select! {
            received = uplink_rx.recv() => match received {
                Some(frame) => queue.push(frame),
                None => break,
            },
            _ = cadence.tick() => {
                flush_uplinks(&client, &mut queue).await;

                match client.poll_downlinks().await {
                    Ok(frames) => {
                        for frame in frames {
                            if downlink_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!("downlink poll failed: {}", e),
                }
            }
        }
    }

    // Supervisor is shutting down; one last best-effort flush.
    flush_uplinks(&client, &mut queue).await;
    info!("cloud bridge stopped");
}

async fn flush_uplinks(client: &CloudClient, queue: &mut UplinkQueue) {
    for _ in 0..MAX_FLUSH_PER_CYCLE {
        let Some(frame) = queue.front() else { break };
        match client.submit_uplink(frame).await {
            Ok(()) => {
                queue.pop();
            }
            Err(e) => {
                // Leave the queue intact; the next cycle retries.
                debug!(queued = queue.len(), "uplink submission failed: {}", e);
                break;
            }
        }
    }
}
