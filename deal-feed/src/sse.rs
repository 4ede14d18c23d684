//! `text/event-stream` over a long-lived HTTP GET.

use futures::future::{FutureExt, LocalBoxFuture};
use futures::{StreamExt, TryStreamExt};

use crate::config::FeedConfig;
use crate::error::TransportError;
use crate::subscription::{EventStream, EventTransport};

/// One dispatched server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl ServerEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Feed it body chunks as they arrive; it returns whatever events those chunks
/// completed. Chunks may split lines and multi-byte characters anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            // retry hints are ignored, reconnect pacing is ours
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<ServerEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(ServerEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

/// [`EventTransport`] that dials the backend's event stream endpoint.
#[derive(Clone, Debug)]
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.stream_url())
    }
}

impl EventTransport for SseTransport {
    fn open(&self) -> LocalBoxFuture<'static, Result<EventStream, TransportError>> {
        let request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let url = self.url.clone();

        async move {
            let response = request
                .send()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }
            log::debug!("Connected to event stream at {url}");

            let mut decoder = SseDecoder::default();
            let events = response
                .bytes_stream()
                .map_err(|e| TransportError::Stream(e.to_string()))
                .map_ok(move |chunk| {
                    futures::stream::iter(decoder.feed(&chunk).into_iter().map(Ok))
                })
                .try_flatten()
                .boxed_local();
            Ok(events)
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_event() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(b"event: new-deal\ndata: {\"id\":1}\n\n");
        assert_eq!(events, vec![ServerEvent::new("new-deal", "{\"id\":1}")]);
    }

    #[test]
    fn test_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"event: image-upd").is_empty());
        assert!(decoder.feed(b"ated\r\ndata: {\"id\":2,").is_empty());
        let events = decoder.feed(b"\"localPath\":\"a.jpg\"}\r\n\r\n");
        assert_eq!(
            events,
            vec![ServerEvent::new(
                "image-updated",
                "{\"id\":2,\"localPath\":\"a.jpg\"}"
            )]
        );
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let payload = "data: promoção\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.feed(&payload[..split]).is_empty());
        let events = decoder.feed(&payload[split..]);
        assert_eq!(events[0].data, "promoção");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_comments_multiline_data_and_ids() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(b": keep-alive\n\nid: 9\ndata: a\ndata:b\n\nevent: x\n\n");
        // The keep-alive and the data-less `x` event dispatch nothing
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].id.as_deref(), Some("9"));
    }

    #[test]
    fn test_event_name_does_not_leak_into_next_event() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(b"event: new-deal\ndata: 1\n\ndata: 2\n\n");
        assert_eq!(events[0].event, "new-deal");
        assert_eq!(events[1].event, "message");
    }
}
