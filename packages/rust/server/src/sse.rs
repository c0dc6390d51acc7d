//! Server-sent event streams backed by broadcaster connections.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};

use codekb_core::{Broadcaster, ConnectionId, StreamReceiver};

/// Unsubscribes its connection when the response stream is dropped.
struct Unsubscribe {
    broadcaster: Broadcaster,
    id: ConnectionId,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

/// Turn a connection's frame receiver into an SSE response.
///
/// Each frame becomes one `data: <json>` event. The stream ends when the
/// broadcaster closes the connection.
pub(crate) fn event_stream(
    broadcaster: Broadcaster,
    id: ConnectionId,
    rx: StreamReceiver,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = Unsubscribe { broadcaster, id };
    let frames = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        Some((Ok(Event::default().data(frame)), (rx, guard)))
    });
    Sse::new(frames).keep_alive(KeepAlive::default())
}
