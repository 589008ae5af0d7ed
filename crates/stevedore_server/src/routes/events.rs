//! Realtime transports: WebSocket and Server-Sent Events.
//!
//! Both wrap one hub subscription. Resume works by sequence number:
//! `?afterSeq=` on either transport, or the standard `Last-Event-ID`
//! header on SSE. `?includeLogs=false` drops the high-volume
//! `job.log` stream.

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use stevedore_protocol::events::Event;

use crate::AppState;

const WS_PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStreamQuery {
    #[serde(default)]
    after_seq: Option<u64>,
    #[serde(default)]
    include_logs: Option<bool>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| {
        ws_loop(
            state,
            socket,
            query.after_seq,
            query.include_logs.unwrap_or(true),
        )
    })
}

async fn ws_loop(state: AppState, mut socket: WebSocket, after_seq: Option<u64>, include_logs: bool) {
    let mut subscription = state.hub.subscribe(after_seq, include_logs);

    for event in subscription.backlog.drain(..) {
        if send_ws_event(&mut socket, &event).await.is_err() {
            state.hub.unsubscribe(subscription.subscriber_id);
            return;
        }
    }

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                if send_ws_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Pongs and stray client frames are ignored.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("websocket receive error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unsubscribe(subscription.subscriber_id);
}

async fn send_ws_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let frame = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(frame)).await
}

pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    // Last-Event-ID (set by the browser on reconnect) wins over the
    // explicit query parameter.
    let after_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or(query.after_seq);
    let include_logs = query.include_logs.unwrap_or(true);

    let subscription = state.hub.subscribe(after_seq, include_logs);

    // Backlog first, then live events. Dropping the receiver (client
    // disconnect) unsubscribes implicitly: the hub reaps closed
    // subscribers on its next publish.
    let backlog = futures::stream::iter(
        subscription
            .backlog
            .into_iter()
            .map(|event| Ok(to_sse_frame(&event))),
    );
    let live = ReceiverStream::new(subscription.receiver)
        .map(|event| Ok(to_sse_frame(&event)));

    Sse::new(backlog.chain(live)).keep_alive(KeepAlive::default())
}

fn to_sse_frame(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(serde_json::to_string(event).unwrap_or_default())
}
