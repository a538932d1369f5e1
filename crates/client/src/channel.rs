//! WebSocket event channel for one job submission.
//!
//! One connection is opened per `submit()` call, scoped to the
//! submission's client id via the `clientId` query parameter. The
//! receive loop runs on a dedicated task and hands every text frame to
//! the dispatcher in arrival order; the loop ends when the
//! cancellation token fires (terminal transition, explicit close, or
//! timeout), when the peer closes, or on a transport error.

use std::sync::Arc;

use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::dispatch;
use crate::tracker::TrackerState;

/// Connect and pump events until the channel dies or is cancelled.
///
/// A connect failure marks the job `fail` (the submission went through
/// but tracking never started); a receive error on the live connection
/// marks it `error`. A clean close by the peer leaves the status
/// untouched -- if the job is not terminal yet, the caller's wait
/// timeout is the liveness guard.
pub(crate) async fn run_event_channel(
    ws_url: String,
    client_id: String,
    state: Arc<TrackerState>,
    cancel: CancellationToken,
) {
    let url = format!("{ws_url}/ws?clientId={client_id}");

    let mut ws_stream = match connect_async(&url).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "Failed to open event channel");
            state.fail(format!("Failed to connect to {url}: {e}"), None);
            return;
        }
    };
    tracing::info!(client_id = %client_id, "Event channel open");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Terminal transition, timeout, or explicit close.
                let _ = ws_stream.close(None).await;
                tracing::debug!(client_id = %client_id, "Event channel closed");
                return;
            }
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch::handle_text_frame(&state, &text);
                }
                Some(Ok(Message::Binary(_))) => {
                    // Preview image frames; not part of status tracking.
                    tracing::trace!(client_id = %client_id, "Ignoring binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Handled automatically by tungstenite.
                }
                Some(Ok(Message::Close(close_frame))) => {
                    tracing::info!(client_id = %client_id, ?close_frame, "Event channel closed by peer");
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::error!(client_id = %client_id, error = %e, "Event channel receive error");
                    state.channel_error(e.to_string());
                    return;
                }
                None => {
                    tracing::info!(client_id = %client_id, "Event channel stream ended");
                    return;
                }
            }
        }
    }
}
