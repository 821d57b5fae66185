// =============================================================================
// Dashboard push channel — `/api/v1/ws`
// =============================================================================
//
// A client gets the whole DashboardSnapshot as soon as it connects, then a
// fresh one at most every 500 ms, and only when the combined version moved.
// Text frames from the client are heartbeats; nothing else is read from it.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

const PUSH_INTERVAL: Duration = Duration::from_millis(500);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_dashboard(socket, state))
}

/// One client: push on version change, answer pings, stop on close or error.
async fn serve_dashboard(socket: WebSocket, state: Arc<AppState>) {
    let clients = state.ws_clients.fetch_add(1, Ordering::Relaxed) + 1;
    info!(clients, "dashboard client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut sequence: u64 = 0;

    let mut last_sent_version = match send_snapshot(&mut sender, &state, &mut sequence).await {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %e, "initial snapshot not delivered");
            cleanup(&state);
            return;
        }
    };

    let mut push_interval = interval(PUSH_INTERVAL);
    push_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                if state.current_state_version() != last_sent_version {
                    match send_snapshot(&mut sender, &state, &mut sequence).await {
                        Ok(version) => last_sent_version = version,
                        Err(e) => {
                            debug!(error = %e, "dashboard client unreachable");
                            break;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(len = text.len(), "client heartbeat");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "pong not delivered");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "dashboard client read failed");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state);
}

/// Send the current snapshot and return the version it was built at.
async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    sequence: &mut u64,
) -> Result<u64, axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    state.ws_sequence_number.fetch_add(1, Ordering::Relaxed);
    *sequence += 1;

    let snapshot = state.build_snapshot();

    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(version = snapshot.state_version, seq = *sequence, "snapshot pushed");
        }
        Err(e) => {
            warn!(error = %e, "snapshot not serialisable, skipped");
        }
    }
    Ok(snapshot.state_version)
}

fn cleanup(state: &Arc<AppState>) {
    let remaining = state.ws_clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    info!(clients = remaining, "dashboard client disconnected");
}

// =============================================================================
// Tests
// =============================================================================
