// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! WebSocket upgrade and per-connection reader/writer tasks (spec §4.E).
//!
//! Grounded on the teacher's `src/web/websocket.rs` `upgrade()` helper
//! (computing the `Sec-WebSocket-Accept` response via `tungstenite`'s
//! handshake module atop a hyper `Upgraded` connection) and
//! `src/web/live.rs`'s per-subscriber task split, generalized to the
//! bounded multi-client hub: one reader task parses inbound `ping`
//! frames, one writer task drains the client's `mpsc` queue.

use super::{full_body, AppState, BoxBody};
use crate::json::{ClientEvent, ServerEvent};
use futures::{SinkExt, StreamExt};
use http::{Request, Response, StatusCode};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

pub async fn upgrade(
    state: Arc<AppState>,
    channel: String,
    mut req: Request<hyper::body::Incoming>,
) -> Response<BoxBody> {
    let Some(key) = req.headers().get("sec-websocket-key").cloned() else {
        return plain(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };

    // Clients may offer `permessage-deflate` in `Sec-WebSocket-Extensions`;
    // `tungstenite` has no support for the extension (it frames at the
    // `Message` level, with no hook to flip RSV1 and (de)compress a raw
    // payload), so it's never acknowledged here. Per RFC 7692 §5.1, omitting
    // the extension from the response is a valid decline — the connection
    // proceeds uncompressed rather than risk acking a capability we can't
    // deliver.

    let session = match state.hub.register(&channel) {
        Ok(s) => s,
        Err(crate::hub::AdmissionError::UnknownChannel) => {
            return plain(StatusCode::NOT_FOUND, "no such channel")
        }
        Err(crate::hub::AdmissionError::AtCapacity) => {
            return plain(StatusCode::BAD_REQUEST, "connection limit reached")
        }
    };
    state.metrics.on_connect();

    let media_base_url = match state.db.get_recent_stream(&channel).await {
        Ok(Some(s)) => state.store.get_url(&format!("{channel}/{}", s.stream_id)),
        Ok(None) => state.store.get_url(&channel),
        Err(e) => {
            error!(error = %e, channel, "failed loading recent stream for handshake");
            state.hub.evict(&channel, session.id);
            state.metrics.on_disconnect();
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "handshake failed");
        }
    };

    let state2 = state.clone();
    let channel2 = channel.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = hyper_util::rt::TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                run_connection(state2, channel2, session, ws, media_base_url).await;
            }
            Err(e) => {
                warn!(error = %e, "websocket upgrade failed after 101 response");
                state2.hub.evict(&channel2, session.id);
                state2.metrics.on_disconnect();
            }
        }
    });

    let accept = accept_key(key.as_bytes());
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::CONNECTION, "Upgrade")
        .header(http::header::UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", accept)
        .body(full_body(bytes::Bytes::new()))
        .expect("valid 101 response")
}

fn plain(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(full_body(msg.to_string()))
        .expect("valid response")
}

/// Computes `Sec-WebSocket-Accept` per RFC 6455 §1.3 via `tungstenite`'s own
/// handshake helper (the same one its server-side `accept()` path uses),
/// rather than hand-rolling the SHA-1/base64 derivation.
fn accept_key(client_key: &[u8]) -> String {
    tokio_tungstenite::tungstenite::handshake::derive_accept_key(client_key)
}

async fn run_connection(
    state: Arc<AppState>,
    channel: String,
    mut session: crate::hub::ClientSession,
    ws: WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>,
    media_base_url: String,
) {
    let (mut sink, mut stream) = ws.split();

    match state.hub.handshake(&state.db, &channel, &media_base_url).await {
        Ok(frames) => {
            for frame in frames {
                if send_frame(&mut sink, &frame).await.is_err() {
                    cleanup(&state, &channel, session.id).await;
                    return;
                }
            }
        }
        Err(e) => {
            error!(error = %e, channel, "building handshake sequence failed");
            cleanup(&state, &channel, session.id).await;
            return;
        }
    }

    let writer = {
        let channel = channel.clone();
        tokio::spawn(async move {
            while let Some(event) = session.rx.recv().await {
                if send_frame(&mut sink, &event).await.is_err() {
                    debug!(channel, "writer: client disconnected");
                    break;
                }
            }
        })
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(ClientEvent::Ping { timestamp }) = serde_json::from_str::<ClientEvent>(&text) {
                    state.hub.send_to(&channel, session.id, ServerEvent::Pong { timestamp });
                }
            }
            Ok(Message::Close(frame)) => {
                classify_close(&state, &channel, frame.as_ref().map(|f| f.code));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                classify_error(&state, &channel, &e);
                break;
            }
        }
    }

    writer.abort();
    cleanup(&state, &channel, session.id).await;
}

async fn send_frame(
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    event: &ServerEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).expect("serializable event");
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn cleanup(state: &Arc<AppState>, channel: &str, id: crate::hub::ClientId) {
    state.hub.evict(channel, id);
    state.metrics.on_disconnect();
}

/// Classifies a clean close frame per spec §4.E: normal/going-away/no-status
/// are ordinary client disconnects (debug); anything else counts as a
/// websocket error.
fn classify_close(state: &AppState, channel: &str, code: Option<CloseCode>) {
    match code {
        None | Some(CloseCode::Normal) | Some(CloseCode::Away) | Some(CloseCode::Status) => {
            debug!(channel, ?code, "client disconnected");
        }
        Some(other) => {
            warn!(channel, ?other, "websocket closed with unexpected code");
            state.metrics.on_websocket_error(channel);
        }
    }
}

/// Classifies a stream-level error (spec §4.E: abnormal closure 1006,
/// `ConnectionClosed`, `AlreadyClosed`, EPIPE/ECONNRESET all count as an
/// ordinary disconnect; anything else is a websocket error worth a metric).
fn classify_error(state: &AppState, channel: &str, e: &tokio_tungstenite::tungstenite::Error) {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            debug!(channel, "client disconnect");
        }
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ) =>
        {
            debug!(channel, "client disconnect (io)");
        }
        other => {
            warn!(channel, error = %other, "websocket read error");
            state.metrics.on_websocket_error(channel);
        }
    }
}
