//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use subway_auth::Credentials;
use subway_core::close::INTERNAL_ERROR;
use subway_core::{CloseReason, OperationMessage};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::{ConnectionController, ConnectionState};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;
use crate::transport::{ActivityClock, WsTransport};
use crate::writer::OrderedWriter;

/// How long a finished session waits for its queued output to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the read loop should do with one inbound frame.
enum Frame {
    Text(String),
    Undecodable,
    Skip,
    Closed,
}

fn classify(frame: Option<Result<Message, axum::Error>>) -> Frame {
    match frame {
        Some(Ok(Message::Text(text))) => Frame::Text(text.to_string()),
        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Frame::Text(text),
            Err(_) => {
                debug!(len = data.len(), "non-UTF8 binary frame");
                Frame::Undecodable
            }
        },
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Frame::Skip,
        Some(Ok(Message::Close(frame))) => {
            info!(code = frame.as_ref().map(|f| f.code), "client sent close frame");
            Frame::Closed
        }
        Some(Err(e)) => {
            debug!(error = %e, "websocket read failed");
            Frame::Closed
        }
        None => Frame::Closed,
    }
}

/// Run a session for an upgraded socket.
///
/// 1. Builds the outbound writer and the connection controller
/// 2. Starts the `connection_init` timer
/// 3. Decodes inbound frames and hands them to the controller in arrival order
/// 4. On server shutdown, sends a going-away close
/// 5. Tears the connection down and waits for queued output to flush
#[instrument(skip_all, fields(connection_id = %connection_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    connection_id: String,
    credentials: Credentials,
    state: AppState,
) {
    let (sink, mut frames) = socket.split();
    let ws_settings = &state.settings.websocket;
    let clock = ActivityClock::new();
    let writer = OrderedWriter::spawn(
        WsTransport::new(sink),
        ws_settings.writer_capacity,
        clock.clone(),
    );

    let controller = match ConnectionController::new(
        connection_id.clone(),
        ws_settings,
        state.services.clone(),
        credentials,
        writer.clone(),
        clock,
        &state.shutdown.token(),
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "rejecting connection");
            let _ = writer
                .close(CloseReason::new(INTERNAL_ERROR, "Server misconfigured"))
                .await;
            writer.complete();
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer.completion()).await;
            return;
        }
    };

    let connection_start = Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    state.connections.add(Arc::clone(&controller));
    controller.initialize_connection();

    loop {
        let frame = tokio::select! {
            () = controller.closed() => break,
            frame = frames.next() => classify(frame),
        };
        let result = match frame {
            Frame::Text(text) => match OperationMessage::from_json(&text) {
                Ok(message) => controller.on_message_received(message).await,
                Err(e) => {
                    debug!(error = %e, "invalid message");
                    controller.on_invalid_frame().await
                }
            },
            Frame::Undecodable => controller.on_invalid_frame().await,
            Frame::Skip => continue,
            Frame::Closed => break,
        };
        if result.is_err() {
            break;
        }
    }

    if state.shutdown.is_shutting_down() && controller.state() != ConnectionState::Closed {
        let _ = writer.close(CloseReason::going_away()).await;
    }
    controller.dispose();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer.completion())
        .await
        .is_err()
    {
        warn!("outbound queue did not drain in time");
    }
    state.connections.remove(&connection_id);

    info!("client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}
