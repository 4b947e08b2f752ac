//! Async stream that converts an HTTP body into SSE events.

use crate::error::TransportError;
use crate::sse::{SseEvent, SseParser};
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// An async stream of [`SseEvent`]s read from a `text/event-stream` body.
    pub struct EventStream {
        #[pin]
        inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
        parser: SseParser,
        ready: VecDeque<SseEvent>,
        // Bytes of a UTF-8 sequence split across chunks.
        carry: Vec<u8>,
    }
}

impl EventStream {
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            ready: VecDeque::new(),
            carry: Vec::new(),
        }
    }

    /// Stream the body of an HTTP response.
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }
}

impl Stream for EventStream {
    type Item = Result<SseEvent, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.carry.extend_from_slice(&bytes);
                    let valid_up_to = match std::str::from_utf8(&this.carry[..]) {
                        Err(e) if e.error_len().is_none() => e.valid_up_to(),
                        _ => this.carry.len(),
                    };
                    let text = String::from_utf8_lossy(&this.carry[..valid_up_to]).into_owned();
                    this.carry.drain(..valid_up_to);
                    this.ready.extend(this.parser.feed(&text));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(TransportError::Network(e.to_string()))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
