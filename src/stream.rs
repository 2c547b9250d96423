/// stream.rs – Push-stream transports (WebSocket and server-sent events).
///
/// Both sources only yield raw message bodies; decoding happens in the
/// normalizer. There is no reconnection: the connector falls back
/// to polling on the first failure.
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::connector::{PushSource, RawMessageStream};

/// Pick a transport from the URL scheme.
pub fn push_source_for(url: &str, connect_timeout_secs: f64) -> Result<Arc<dyn PushSource>> {
    let lower = url.trim().to_ascii_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        Ok(Arc::new(WsPushSource::new(url.trim())))
    } else if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(Arc::new(SsePushSource::new(url.trim(), connect_timeout_secs)?))
    } else {
        bail!("unsupported push stream URL: {url}")
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

pub struct WsPushSource {
    url: String,
}

impl WsPushSource {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl PushSource for WsPushSource {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<RawMessageStream> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .context("WebSocket connect")?;
        // tungstenite answers pings on the next read.
        let messages = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::new(e).context("WebSocket read error"))),
            }
        });
        Ok(Box::pin(messages))
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

pub struct SsePushSource {
    url: String,
    http: Client,
}

impl SsePushSource {
    /// The client gets a connect timeout only; a request timeout would cut
    /// the long-lived body.
    pub fn new(url: &str, connect_timeout_secs: f64) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(std::time::Duration::from_secs_f64(connect_timeout_secs))
            .build()
            .context("building SSE client")?;
        Ok(Self {
            url: url.to_string(),
            http,
        })
    }
}

#[async_trait]
impl PushSource for SsePushSource {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<RawMessageStream> {
        let resp = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .context("SSE connect")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("SSE endpoint answered {status}");
        }

        let bytes = Box::pin(resp.bytes_stream());
        let events = futures_util::stream::unfold(
            (bytes, SseDecoder::default(), VecDeque::new()),
            |(mut bytes, mut decoder, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (bytes, decoder, pending)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.feed(&chunk)),
                        Some(Err(e)) => {
                            let err = anyhow::Error::new(e).context("SSE read error");
                            return Some((Err(err), (bytes, decoder, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(events))
    }
}

/// Incremental `text/event-stream` decoder. Yields the joined `data:` lines
/// of each event; `event:`, `id:`, `retry:` and comment lines are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if line.is_empty() {
                if !self.data.is_empty() {
                    out.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else {
                debug!("Ignoring SSE line: {line}");
            }
        }
        out
    }
}
