use crate::error::ErrorCategory;
use crate::sfu::{PeerSession, SfuSessionManager};
use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response as HttpResponse,
};
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{ClientMessage, PeerId, Request, Response, ServerMessage};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> HttpResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let peer_id = PeerId::new();
    let session = match state.sfu.connect_peer(peer_id, tx).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to register peer {}: {}", peer_id, e);
            return;
        }
    };
    session.push(&ServerMessage::Welcome { peer_id });

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_text(&state.sfu, &session, text.as_str()),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error for peer {}: {}", peer_id, e);
                break;
            }
            _ => {}
        }
    }

    state.sfu.disconnect(peer_id).await;
    send_task.abort();

    tracing::info!("Peer {} disconnected from WebSocket", peer_id);
}

/// Parse one frame and answer it on a task of its own.
///
/// Requests from the same peer run concurrently; the response carries the
/// request id so the client can match it.
fn handle_text(sfu: &Arc<SfuSessionManager>, session: &Arc<PeerSession>, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Invalid message from {}: {}", session.id(), e);
            session.push(&rejection(text, &e));
            return;
        }
    };

    let sfu = sfu.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let data = dispatch(&sfu, session.id(), message.request).await;
        session.push(&ServerMessage::Response {
            request_id: message.request_id,
            data,
        });
    });
}

/// Answer to a frame that did not parse. Frames with a readable request id
/// get a failed response, anything else a bare error.
fn rejection(text: &str, error: &serde_json::Error) -> ServerMessage {
    let request_id = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("requestId").and_then(Value::as_u64));

    match request_id {
        Some(request_id) => ServerMessage::Response {
            request_id,
            data: Response::error(format!("Invalid request: {}", error)),
        },
        None => ServerMessage::Error {
            message: "Invalid message format".to_string(),
        },
    }
}

/// Run one request against the session manager. Failures become `{error}` payloads.
pub async fn dispatch(sfu: &SfuSessionManager, peer_id: PeerId, request: Request) -> Response {
    let name = request.name();
    tracing::info!("Peer {} requested {}", peer_id, name);

    let result = match request {
        Request::GetRouterRtpCapabilities => sfu
            .router_rtp_capabilities()
            .map(Response::RouterRtpCapabilities),
        Request::CreateTransport { direction } => {
            sfu.create_transport(peer_id, direction)
                .await
                .map(|info| Response::TransportCreated {
                    id: info.id,
                    ice_parameters: info.ice_parameters,
                    ice_candidates: info.ice_candidates,
                    dtls_parameters: info.dtls_parameters,
                })
        }
        Request::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => sfu
            .connect_transport(peer_id, transport_id, dtls_parameters)
            .await
            .map(|()| Response::TransportConnected { connected: true }),
        Request::Produce {
            kind,
            rtp_parameters,
            app_data,
        } => sfu
            .produce(peer_id, kind, rtp_parameters, app_data)
            .await
            .map(|id| Response::Produced { id }),
        Request::Consume {
            producer_id,
            rtp_capabilities,
        } => sfu
            .consume(peer_id, producer_id, rtp_capabilities)
            .await
            .map(|info| Response::Consumed {
                id: info.id,
                producer_id: info.producer_id,
                kind: info.kind,
                rtp_parameters: info.rtp_parameters,
            }),
        Request::GetProducers => Ok(Response::Producers(sfu.get_producers(peer_id).await)),
    };

    result.unwrap_or_else(|e| {
        if e.category() == ErrorCategory::MediaEngine {
            tracing::error!("Peer {} {} failed: {}", peer_id, name, e);
        } else {
            tracing::warn!("Peer {} {} failed: {}", peer_id, name, e);
        }
        Response::error(e.client_message())
    })
}
