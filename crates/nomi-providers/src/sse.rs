//! Generic SSE (Server-Sent Events) line parser.
//!
//! Converts a byte stream (usually a `reqwest::Response` body) into a
//! `Stream<Item = SseEvent>`.

use std::fmt::Display;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    sse_events(response.bytes_stream())
}

/// Parse any chunked byte stream as SSE.
///
/// Lines are split on raw bytes so multi-byte UTF-8 sequences that straddle a
/// chunk boundary decode correctly.
pub fn sse_events<S, E>(byte_stream: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + 'static,
{
    let byte_stream: ByteStream = Box::pin(
        byte_stream.map(|chunk| chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {e}"))),
    );

    futures::stream::unfold(
        SseState {
            byte_stream,
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
            finished: false,
        },
        |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                if let Some(newline_pos) = state.buffer.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..newline_pos]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    state.apply_field(line);
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        // Stream ended: a trailing line without newline still counts.
                        if !state.buffer.is_empty() {
                            let rest = std::mem::take(&mut state.buffer);
                            let line = String::from_utf8_lossy(&rest).into_owned();
                            state.apply_field(line.trim_end_matches('\r'));
                        }
                        state.finished = true;
                        return state.take_event().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

struct SseState {
    byte_stream: ByteStream,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    finished: bool,
}

impl SseState {
    fn apply_field(&mut self, line: &str) {
        if line.starts_with(':') {
            // Comment / keep-alive
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.current_event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.current_data.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            self.current_id = Some(value.trim_start().to_string());
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        Some(SseEvent {
            event: self.current_event.take(),
            data: std::mem::take(&mut self.current_data).join("\n"),
            id: self.current_id.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type ChunkIter = futures::stream::Iter<std::vec::IntoIter<Result<Bytes, std::io::Error>>>;

    fn chunks(parts: &[&[u8]]) -> ChunkIter {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        futures::stream::iter(owned)
    }

    async fn collect(parts: &[&[u8]]) -> Vec<anyhow::Result<SseEvent>> {
        sse_events(chunks(parts)).collect().await
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let events = collect(&[b"data: {\"a\"", b":1}\n\nda", b"ta: [DONE]\n\n"]).await;
        let data: Vec<String> = events.into_iter().map(|e| e.unwrap().data).collect();
        assert_eq!(data, vec![r#"{"a":1}"#.to_string(), "[DONE]".to_string()]);
    }

    #[tokio::test]
    async fn test_multiline_data_and_fields() {
        let events =
            collect(&[b"event: delta\r\nid: 7\r\ndata: one\r\ndata: two\r\n\r\n"]).await;
        assert_eq!(events.len(), 1);
        let event = events.into_iter().next().unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("delta"));
        assert_eq!(event.id.as_deref(), Some("7"));
        assert_eq!(event.data, "one\ntwo");
    }

    #[tokio::test]
    async fn test_comments_are_skipped() {
        let events = collect(&[b": keep-alive\n\ndata: x\n\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().data, "x");
    }

    #[tokio::test]
    async fn test_trailing_event_without_blank_line() {
        let events = collect(&[b"data: tail"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().data, "tail");
    }

    #[tokio::test]
    async fn test_utf8_split_across_chunks() {
        let text = "data: héllo\n\n".as_bytes();
        // split inside the two-byte 'é'
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let events = collect(&[&text[..split], &text[split..]]).await;
        assert_eq!(events[0].as_ref().unwrap().data, "héllo");
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: ok\n\n")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let events: Vec<_> = sse_events(futures::stream::iter(parts)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        let err = events[1].as_ref().unwrap_err().to_string();
        assert!(err.contains("reset"), "unexpected error: {err}");
    }
}
