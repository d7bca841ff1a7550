use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

use crate::middleware::auth::Caller;
use crate::AppState;

/// Server-sent `transfer.created` / `transfer.updated` events for transfers
/// touching the caller's accounts. The subscription ends with the stream.
pub async fn stream_events(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.connections.subscribe(user.id);
    tracing::info!(
        user_id = %user.id,
        connection_id = %subscription.id(),
        connections = state.connections.connection_count(),
        "Event stream opened"
    );

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            match Event::default().event(event.kind.as_str()).json_data(&event.transfer) {
                Ok(sse) => yield Ok::<_, Infallible>(sse),
                Err(e) => tracing::warn!(error = %e, "Failed to encode live update"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
