//! Shared SSE streaming infrastructure for all provider adapters.
//!
//! Every adapter follows the same pattern: receive a `reqwest::Response`,
//! buffer chunks, split on `\n\n`, extract `data:` payloads, and feed each
//! payload to a provider-specific parser producing [`ProviderChunk`]s.

use valet_domain::error::Result;
use valet_domain::stream::{BoxStream, ProviderChunk};

use crate::util::from_reqwest;

/// Extract complete `data:` payloads from an SSE buffer.
///
/// SSE events are delimited by `\n\n`. Event blocks may contain `event:`,
/// `data:`, `id:`, or `retry:` lines; only `data:` lines matter here. The
/// buffer is drained in-place so a trailing partial event survives to the
/// next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a chunk stream from an SSE response and a parser closure.
///
/// The closure is `FnMut` because adapters keep mutable state across data
/// payloads (tool-call assembly). When the body closes the remaining buffer
/// is flushed, and a trailing `Done` is synthesized if the parser never
/// produced one.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<ProviderChunk>>
where
    F: FnMut(&str) -> Vec<Result<ProviderChunk>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    for data in drain_data_lines(&mut buffer) {
                        for chunk in parse_data(&data) {
                            if matches!(&chunk, Ok(ProviderChunk::Done)) {
                                done_emitted = true;
                            }
                            yield chunk;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for chunk in parse_data(&data) {
                                if matches!(&chunk, Ok(ProviderChunk::Done)) {
                                    done_emitted = true;
                                }
                                yield chunk;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(ProviderChunk::Done);
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"hello\":\"world\"}\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["{\"hello\":\"world\"}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_partial_event_stays_in_buffer() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["complete"]);
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn drain_ignores_non_data_lines() {
        let mut buf = String::from("event: ping\nid: 42\nretry: 5000\ndata: payload\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["payload"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_incremental_buffering() {
        let mut buf = String::from("data: chunk1");
        assert!(drain_data_lines(&mut buf).is_empty());
        assert_eq!(buf, "data: chunk1");

        buf.push_str("\n\ndata: chunk2\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["chunk1", "chunk2"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_done_sentinel_preserved() {
        let mut buf = String::from("data: [DONE]\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["[DONE]"]);
    }
}
