//! Server-sent event framing for generation sessions
//!
//! Every [`StreamEvent`] becomes one `data: <json>\n\n` frame. A `[DONE]`
//! frame follows the terminal event. When the peer disconnects, hyper drops
//! the body, which drops the [`EventStream`] and cancels the session.

use std::{
    convert::Infallible,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use axum::{
    http::header::{self, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::{Stream, StreamExt};
use shared_types::{StreamEvent, DONE_SENTINEL};
use tracing::{debug, error};

use crate::sequencer::EventStream;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

const ENCODE_FAILURE_FRAME: &str =
    r#"{"type":"error","data":{"message":"Failed to encode generation event"}}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Streaming,
    DonePending,
    Closed,
}

/// Frames for one session, closed by `[DONE]` after the terminal event.
///
/// A session that ends without a terminal event (cancelled) closes without
/// the sentinel.
#[derive(Debug)]
pub struct FrameStream {
    events: EventStream,
    state: FrameState,
    frames: usize,
}

impl FrameStream {
    pub fn new(events: EventStream) -> Self {
        Self {
            events,
            state: FrameState::Streaming,
            frames: 0,
        }
    }
}

fn encode(event: &StreamEvent) -> Result<Event, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Event::default().data(json))
}

impl Stream for FrameStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.state {
            FrameState::Closed => Poll::Ready(None),
            FrameState::DonePending => {
                self.state = FrameState::Closed;
                debug!(
                    session_id = %self.events.session_id(),
                    frames = self.frames,
                    "generation stream finished"
                );
                Poll::Ready(Some(Ok(Event::default().data(DONE_SENTINEL))))
            }
            FrameState::Streaming => match ready!(self.events.poll_next_unpin(cx)) {
                Some(event) => {
                    self.frames += 1;
                    let frame = match encode(&event) {
                        Ok(frame) => {
                            if event.is_terminal() {
                                self.state = FrameState::DonePending;
                            }
                            frame
                        }
                        Err(e) => {
                            error!(session_id = %self.events.session_id(), kind = event.kind(), "failed to encode event: {e}");
                            self.events.cancel();
                            self.state = FrameState::DonePending;
                            Event::default().data(ENCODE_FAILURE_FRAME)
                        }
                    };
                    Poll::Ready(Some(Ok(frame)))
                }
                None => {
                    debug!(session_id = %self.events.session_id(), "generation stream closed without terminal event");
                    self.state = FrameState::Closed;
                    Poll::Ready(None)
                }
            },
        }
    }
}

/// Streaming `200` response for one session.
///
/// Headers keep proxies from buffering or caching frames. Besides `data:`
/// frames, the body carries an SSE comment frame (a line starting with `:`)
/// every `KEEP_ALIVE_INTERVAL` while the agent is silent. Consumers must skip
/// frames that have no `data:` line.
pub fn stream_response(events: EventStream) -> Response {
    let sse = Sse::new(FrameStream::new(events))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL));

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response()
}
