use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue};

use super::{parse_frame, FrameError, Message, ParseOutcome};
use crate::error::{Error, Result};

/// Upstream body bytes, boxed so the transcoder works over any transport.
pub type UpstreamByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Transcode an AWS event-stream body into Server-Sent Events.
///
/// Each yielded item is one complete SSE event, so a writer that flushes
/// per chunk never exposes a partially written event to the client.
/// Corrupt frames are skipped; a frame whose declared length outruns the
/// finished upstream body terminates the stream with an error.
pub struct EventStreamToSse {
    inner: UpstreamByteStream,
    buffer: BytesMut,
    finished: bool,
}

impl EventStreamToSse {
    pub fn new(inner: UpstreamByteStream) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            finished: false,
        }
    }
}

impl Stream for EventStreamToSse {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match parse_frame(&this.buffer) {
                Ok(ParseOutcome::Frame { message, consumed }) => {
                    this.buffer.advance(consumed);
                    if let Some(event) = render_sse(&message) {
                        return Poll::Ready(Some(Ok(event)));
                    }
                    continue;
                }
                Ok(ParseOutcome::Skipped { consumed, reason }) => {
                    tracing::warn!(%reason, consumed, "skipping corrupt event-stream frame");
                    this.buffer.advance(consumed);
                    continue;
                }
                Ok(ParseOutcome::Incomplete) => {}
                Err(err) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(err.into())));
                }
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    // A verifiable prelude promising more than the body
                    // delivered is a protocol violation; an unverifiable
                    // tail is just line noise after the last frame.
                    if let Some((total, _)) = super::checked_prelude(&this.buffer) {
                        return Poll::Ready(Some(Err(Error::EventStream(
                            FrameError::Truncated {
                                total,
                                available: this.buffer.len(),
                            },
                        ))));
                    }
                    tracing::warn!(
                        remaining = this.buffer.len(),
                        "discarding unparseable event-stream tail"
                    );
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Render one decoded message as an SSE event.
///
/// Exceptions become the Anthropic `error` event; normal messages carry
/// their event type through, with multi-line payloads split across
/// `data:` lines. Messages with neither marker are dropped.
fn render_sse(message: &Message) -> Option<Bytes> {
    if let Some(exception) = message.exception_type() {
        let body = serde_json::json!({
            "error": {
                "type": exception,
                "message": String::from_utf8_lossy(message.payload()),
            }
        });
        return Some(Bytes::from(format!("event: error\ndata: {body}\n\n")));
    }

    let event_type = message.event_type()?;
    let payload = String::from_utf8_lossy(message.payload());
    let mut out = String::with_capacity(payload.len() + event_type.len() + 16);
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Some(Bytes::from(out))
}

/// Response headers for a transcoded stream: everything non-content is
/// copied through, then the SSE framing headers are forced.
pub fn sse_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if name == CONTENT_TYPE || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}
