//! Server-sent events change streams.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::SyncError;
use crate::fetch::http::parse_base_url;
use crate::types::Domain;

use super::{ChangeEvent, ChangeSource, ChangeStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatched SSE message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(message) = self.dispatch() {
                    messages.push(message);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }
        messages
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage { event, data, id })
    }
}

/// Optional JSON body of a change message.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeHint {
    #[serde(default, alias = "id")]
    record_id: Option<String>,
}

/// Map a message to a change event. A missing or unreadable body is fine.
pub fn to_change_event(domain: Domain, message: SseMessage) -> Option<ChangeEvent> {
    if matches!(message.event.as_deref(), Some("ping") | Some("heartbeat")) {
        return None;
    }
    let hint: ChangeHint = serde_json::from_str(&message.data).unwrap_or_default();
    Some(ChangeEvent {
        domain,
        event_id: message.id.filter(|id| !id.is_empty()),
        record_id: hint.record_id.filter(|id| !id.is_empty()),
    })
}

// ---------------------------------------------------------------------------
// reqwest-backed source
// ---------------------------------------------------------------------------

pub struct SseChangeSource {
    client: reqwest::Client,
    base_url: Url,
    api: ApiConfig,
}

impl SseChangeSource {
    pub fn new(api: &ApiConfig) -> Result<Self, SyncError> {
        // No overall timeout: the stream is meant to stay open
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build SSE client: {}", e)))?;
        Ok(Self {
            client,
            base_url: parse_base_url(&api.base_url)?,
            api: api.clone(),
        })
    }

    pub fn stream_url(&self, domain: Domain) -> Result<Url, SyncError> {
        let path = self
            .api
            .endpoint(domain)
            .stream_path
            .ok_or_else(|| SyncError::NotConfigured(format!("{} change stream", domain)))?;
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::Config(format!("Invalid stream path '{}': {}", path, e)))
    }
}

#[async_trait]
impl ChangeSource for SseChangeSource {
    async fn connect(&self, domain: Domain) -> Result<Box<dyn ChangeStream>, SyncError> {
        let url = self.stream_url(domain)?;
        let request_id = Uuid::new_v4();
        log::debug!("SSE: connecting {} [{}] ({})", url.path(), domain, request_id);

        let response = self
            .client
            .get(url)
            .header("Accept", "text/event-stream")
            .header("x-request-id", request_id.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::Http {
                status: response.status().as_u16(),
                message: format!("{} change stream refused", domain),
            });
        }

        Ok(Box::new(SseStream {
            domain,
            response,
            parser: SseParser::default(),
            pending: VecDeque::new(),
        }))
    }
}

struct SseStream {
    domain: Domain,
    response: reqwest::Response,
    parser: SseParser,
    pending: VecDeque<ChangeEvent>,
}

#[async_trait]
impl ChangeStream for SseStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SyncError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            match self.response.chunk().await? {
                Some(bytes) => {
                    for message in self.parser.push(&bytes) {
                        if let Some(event) = to_change_event(self.domain, message) {
                            self.pending.push_back(event);
                        }
                    }
                }
                None => return Ok(None),
            }
        }
    }
}
