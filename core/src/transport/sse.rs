/// Server-Sent Events push channel
///
/// The server streams `data: <json PushEvent>\n\n` frames; comment lines
/// (`: ...`) are liveness pings and surface as `PushEvent::KeepAlive`.
use crate::config::Config;
use crate::error::{RealtimeError, Result};
use crate::messenger_types::PushEvent;
use crate::session::Session;
use crate::transport::http_api::{build_client, HttpClient};
use crate::transport::{PushChannel, PushConnector};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, Method, Request};
use http_body_util::{BodyStream, Full};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

/// One complete SSE unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Joined `data:` lines of one event
    Data(String),
    /// `: comment` line
    Comment(String),
}

/// Incremental SSE line parser; tolerates chunks split anywhere, including inside UTF-8
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(SseFrame::Data(self.data.join("\n")));
                    self.data.clear();
                }
            } else if let Some(comment) = line.strip_prefix(':') {
                frames.push(SseFrame::Comment(comment.trim().to_string()));
            } else if let Some(value) = field_value(&line, "data") {
                self.data.push(value.to_string());
            }
            // event:, id:, retry: are not used; the event type lives in the JSON payload
        }

        frames
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    if rest.is_empty() {
        return Some("");
    }
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Translate one SSE frame into a push event. Undecodable payloads are skipped.
pub fn decode_frame(frame: SseFrame) -> Option<PushEvent> {
    match frame {
        SseFrame::Comment(_) => Some(PushEvent::KeepAlive),
        SseFrame::Data(json) => match serde_json::from_str::<PushEvent>(&json) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Skipping malformed push event: {}", e);
                None
            }
        },
    }
}

pub struct SseConnector {
    client: HttpClient,
    events_url: String,
}

impl SseConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            client: build_client(),
            events_url: config.events_url(),
        }
    }
}

#[async_trait]
impl PushConnector for SseConnector {
    async fn open(&self, session: &Session) -> Result<PushChannel> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.events_url.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {}", session.token))
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Full::new(Bytes::new()))
            .map_err(|e| RealtimeError::Connection(format!("Invalid events request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| RealtimeError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RealtimeError::Connection(format!(
                "events endpoint answered {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut body = Box::pin(BodyStream::new(response.into_body()));
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            while let Some(frame) = body.next().await {
                let chunk = match frame {
                    Ok(frame) => match frame.into_data() {
                        Ok(chunk) => chunk,
                        // Trailers carry nothing for us
                        Err(_) => continue,
                    },
                    Err(e) => {
                        warn!("Push stream error: {}", e);
                        break;
                    }
                };
                for event in parser.feed(&chunk).into_iter().filter_map(decode_frame) {
                    if tx.send(event).await.is_err() {
                        debug!("Push channel receiver dropped, closing stream");
                        return;
                    }
                }
            }
            debug!("Push stream ended");
        });

        Ok(rx)
    }
}
