#![forbid(unsafe_code)]

//! Websocket transport: `GET /stream/<session-id>` streams the session's envelopes as JSON text frames.

use std::net::SocketAddr;
use std::sync::Arc;

use chatmux_domain::SessionId;
use chatmux_platform::Envelope;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::connections::{ConnectionItem, ConnectionRegistry};
use crate::server::directory::SessionDirectory;
use crate::server::message_hub::MessageHub;

const STREAM_PATH_PREFIX: &str = "/stream/";

#[derive(Clone)]
pub struct WsServerState {
	pub hub: Arc<MessageHub>,
	pub connections: ConnectionRegistry,
	pub directory: Arc<dyn SessionDirectory>,
}

/// Outbound frame payload.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
	Message(&'a Envelope),
	Lagged { dropped: u64 },
}

pub fn spawn_ws_server(listener: TcpListener, state: WsServerState, stop: CancellationToken) -> JoinHandle<()> {
	tokio::spawn(async move {
		if let Err(e) = run_ws_server(listener, state, stop).await {
			warn!(error = %e, "websocket server stopped");
		}
	})
}

async fn run_ws_server(listener: TcpListener, state: WsServerState, stop: CancellationToken) -> anyhow::Result<()> {
	info!(addr = %listener.local_addr()?, "websocket server listening");
	loop {
		let (stream, remote) = tokio::select! {
			_ = stop.cancelled() => break,
			accepted = listener.accept() => accepted?,
		};

		metrics::counter!("chatmux_ws_connections_total").increment(1);
		let state = state.clone();
		let stop = stop.clone();
		tokio::spawn(async move {
			handle_socket(stream, remote, state, stop).await;
		});
	}
	debug!("websocket server stopped accepting");
	Ok(())
}

/// Extract the session id from a request path.
fn session_from_path(path: &str) -> Option<SessionId> {
	let raw = path.strip_prefix(STREAM_PATH_PREFIX)?;
	if raw.contains('/') {
		return None;
	}
	SessionId::new(raw).ok()
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
	let mut resp = ErrorResponse::new(Some(reason.to_string()));
	*resp.status_mut() = status;
	resp
}

async fn handle_socket(stream: TcpStream, remote: SocketAddr, state: WsServerState, stop: CancellationToken) {
	let mut accepted: Option<SessionId> = None;
	let directory = Arc::clone(&state.directory);
	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		let Some(session) = session_from_path(req.uri().path()) else {
			return Err(reject(StatusCode::NOT_FOUND, "expected /stream/<session-id>"));
		};
		if directory.desired_resources(&session).is_none() {
			return Err(reject(StatusCode::NOT_FOUND, "unknown session"));
		}
		accepted = Some(session);
		Ok(resp)
	};

	let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%remote, error = %e, "websocket handshake rejected");
			return;
		}
	};
	let Some(session) = accepted else {
		return;
	};

	let hub = Arc::clone(&state.hub);
	let mut conn = state
		.connections
		.connect(&session, || {
			let wanted = state.directory.desired_resources(&session).unwrap_or_default();
			hub.add_session(&session);
			hub.register_session_resources(&session, &wanted);
		})
		.await;
	info!(%session, %remote, conn = conn.id, "client connected");

	loop {
		tokio::select! {
			_ = stop.cancelled() => {
				let _ = ws.close(None).await;
				break;
			}
			item = conn.rx.recv() => {
				let Some(item) = item else {
					break;
				};
				let encoded = match &item {
					ConnectionItem::Envelope(env) => serde_json::to_string(&Outbound::Message(env)),
					ConnectionItem::Lagged { dropped } => serde_json::to_string(&Outbound::Lagged { dropped: *dropped }),
				};
				let text = match encoded {
					Ok(text) => text,
					Err(e) => {
						warn!(%session, error = %e, "failed to encode outbound frame");
						continue;
					}
				};
				if ws.send(Message::Text(text.into())).await.is_err() {
					break;
				}
			}
			msg = ws.next() => match msg {
				None | Some(Ok(Message::Close(_))) => break,
				Some(Err(e)) => {
					debug!(%session, error = %e, "websocket read failed");
					break;
				}
				Some(Ok(_)) => {}
			}
		}
	}

	drop(conn.rx);
	state
		.connections
		.disconnect(&session, conn.id, || hub.remove_session(&session))
		.await;
	info!(%session, %remote, conn = conn.id, "client disconnected");
}
