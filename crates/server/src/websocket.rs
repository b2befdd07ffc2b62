//! WebSocket transport
//!
//! Binary messages carry PCM16 LE audio at the wire rate in both directions;
//! text messages carry JSON [`ControlMessage`]s. Each socket becomes one
//! session: the reader turns socket traffic into [`TransportEvent`]s for the
//! orchestrator, and a writer task drains outbound audio and control
//! messages back to the client.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::Response,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use parley_agent::{Session, SessionOrchestrator, SessionStatus};
use parley_core::{AudioChunk, SampleRate};
use parley_pipeline::PipelineEvent;
use parley_transport::{ChannelAudioSink, ControlMessage, Pcm16Codec, TransportEvent};

use crate::state::AppState;
use crate::ServerError;

/// Outbound control messages waiting for the writer
const CONTROL_BUFFER: usize = 16;

/// Time the writer gets to flush after the session ends
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Result<Response, StatusCode> {
    let limit = state.config.server.max_connections;
    if state.connections.len() >= limit {
        tracing::warn!(remote = %remote, limit, "Rejecting connection, server at capacity");
        return Err(ServerError::AtCapacity(limit).into());
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, remote)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, remote: SocketAddr) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let wire_rate =
        SampleRate::from_u32(state.config.vad.sample_rate).unwrap_or(SampleRate::Hz16000);
    let capacity = state.config.pipeline.channel_capacity.max(1);

    let (sink, outbound) = ChannelAudioSink::new(capacity);
    let services = state.services.for_connection(Arc::new(sink));
    let orchestrator =
        SessionOrchestrator::new(connection_id.clone(), services, state.session_config.clone());
    let session = orchestrator.session();

    if let Err(e) = state.connections.try_insert(
        Arc::clone(&session),
        Some(remote.to_string()),
        state.config.server.max_connections,
    ) {
        tracing::warn!(connection_id = %connection_id, error = %e, "Closing socket");
        let _ = socket
            .send(Message::Text(
                ControlMessage::Error {
                    message: e.to_string(),
                }
                .to_json(),
            ))
            .await;
        return;
    }
    metrics::counter!("parley_connections_total").increment(1);
    crate::metrics::record_active_connections(state.connections.len());

    let (ws_tx, mut ws_rx) = socket.split();
    let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
    let writer = tokio::spawn(write_loop(
        ws_tx,
        outbound,
        control_rx,
        Pcm16Codec::new(wire_rate),
    ));
    let notifier = tokio::spawn(notify_loop(
        Arc::clone(&session),
        wire_rate,
        orchestrator.subscribe(),
        control_tx.clone(),
    ));

    let (events_tx, events_rx) = mpsc::channel(capacity);
    let run = tokio::spawn(orchestrator.run(events_rx));

    let _ = events_tx
        .send(TransportEvent::Connected {
            connection_id: connection_id.clone(),
            remote_addr: Some(remote.to_string()),
        })
        .await;

    let mut codec = Pcm16Codec::new(wire_rate);
    let mut status = session.watch_status();
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = status.wait_for(|s| *s == SessionStatus::Closed) => {
                break "session ended".to_string();
            }
            next = ws_rx.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                let _ = events_tx
                    .send(TransportEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
                continue;
            }
            None => break "connection lost".to_string(),
        };

        match message {
            Message::Binary(data) => match codec.decode(Bytes::from(data)) {
                Ok(chunk) => {
                    if events_tx
                        .send(TransportEvent::AudioReceived(chunk))
                        .await
                        .is_err()
                    {
                        break "session ended".to_string();
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        error = %e,
                        "Dropping audio frame"
                    );
                    let _ = control_tx.try_send(ControlMessage::Error {
                        message: e.to_string(),
                    });
                }
            },
            Message::Text(text) => match ControlMessage::from_json(&text) {
                Ok(ControlMessage::Close) => break "client requested close".to_string(),
                Ok(other) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        message = ?other,
                        "Ignoring control message"
                    );
                }
                Err(e) => {
                    metrics::counter!("parley_protocol_violations_total").increment(1);
                    let _ = control_tx.try_send(ControlMessage::Error {
                        message: e.to_string(),
                    });
                }
            },
            Message::Close(frame) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "client closed".to_string());
            }
            // pings are answered by axum
            Message::Ping(_) | Message::Pong(_) => {}
        }
    };

    let _ = events_tx
        .send(TransportEvent::Closed {
            reason: reason.clone(),
        })
        .await;
    drop(events_tx);

    let outcome = match run.await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::error!(connection_id = %connection_id, error = %e, "Session task failed");
            None
        }
    };
    notifier.abort();

    let ended = match outcome.as_ref().and_then(|o| o.error.as_ref()) {
        Some(err) => format!("{}: {}", reason, err),
        None => reason,
    };
    let _ = control_tx.send(ControlMessage::SessionEnded { reason: ended }).await;
    drop(control_tx);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        tracing::debug!(connection_id = %connection_id, "Writer did not flush in time");
    }

    state.connections.remove(&connection_id);
    crate::metrics::record_active_connections(state.connections.len());
    if let Some(outcome) = outcome {
        tracing::info!(
            connection_id = %connection_id,
            status = outcome.status.as_str(),
            degraded = outcome.degraded,
            turns = outcome.turns.len(),
            messages = outcome.record.messages.len(),
            "Connection finished"
        );
    }
}

/// Drain outbound audio and control messages into the socket
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut audio: mpsc::Receiver<AudioChunk>,
    mut control: mpsc::Receiver<ControlMessage>,
    codec: Pcm16Codec,
) {
    let mut audio_open = true;
    loop {
        let message = tokio::select! {
            biased;
            msg = control.recv() => match msg {
                Some(msg) => Message::Text(msg.to_json()),
                None => break,
            },
            chunk = audio.recv(), if audio_open => match chunk {
                Some(chunk) => Message::Binary(codec.encode(&chunk).to_vec()),
                None => {
                    audio_open = false;
                    continue;
                }
            },
        };
        if let Err(e) = ws_tx.send(message).await {
            tracing::debug!(error = %e, "Socket write failed");
            break;
        }
    }
    let _ = ws_tx.close().await;
}

/// Tell the client when the session starts and when playback must stop
async fn notify_loop(
    session: Arc<Session>,
    wire_rate: SampleRate,
    mut events: broadcast::Receiver<PipelineEvent>,
    control: mpsc::Sender<ControlMessage>,
) {
    let mut status = session.watch_status();
    let active = status
        .wait_for(|s| *s >= SessionStatus::Active)
        .await
        .map(|s| *s == SessionStatus::Active)
        .unwrap_or(false);
    if !active {
        return;
    }
    let started = ControlMessage::SessionStarted {
        connection_id: session.connection_id().to_string(),
        sample_rate: wire_rate.as_u32(),
        degraded: session.is_degraded(),
    };
    if control.send(started).await.is_err() {
        return;
    }

    loop {
        match events.recv().await {
            Ok(PipelineEvent::Interrupted { .. }) => {
                if control.send(ControlMessage::Interrupted).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Notifier lagged behind pipeline events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
