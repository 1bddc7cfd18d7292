#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chatmux_domain::Platform;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::emitter::ComposedEmitter;
use crate::server::message_hub::MessageHub;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	status: Option<Arc<StatusSources>>,
}

struct StatusSources {
	emitter: Arc<ComposedEmitter>,
	hub: Arc<MessageHub>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
	pub ready: bool,
	pub sessions: usize,
	pub platforms: Vec<PlatformStatus>,
}

#[derive(Debug, Serialize)]
pub struct PlatformStatus {
	pub platform: Platform,
	pub configured: bool,
	/// Rooms the adapter keeps open.
	pub active_rooms: usize,
	/// Rooms with at least one interested session.
	pub interested_rooms: usize,
	pub last_error: Option<String>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Serve `/statusz` from the running emitter and hub.
	pub fn with_status(mut self, emitter: Arc<ComposedEmitter>, hub: Arc<MessageHub>) -> Self {
		self.status = Some(Arc::new(StatusSources { emitter, hub }));
		self
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	pub fn report(&self) -> Option<StatusReport> {
		let sources = self.status.as_ref()?;
		let platforms = Platform::ALL
			.into_iter()
			.map(|platform| {
				let adapter = sources.emitter.adapter(platform);
				PlatformStatus {
					platform,
					configured: adapter.is_some(),
					active_rooms: adapter.map(|a| a.active_rooms().len()).unwrap_or(0),
					interested_rooms: sources.hub.hub(platform).map(|h| h.room_count()).unwrap_or(0),
					last_error: sources.emitter.last_error(platform),
				}
			})
			.collect();

		Some(StatusReport {
			ready: self.is_ready(),
			sessions: sources.hub.sessions().len(),
			platforms,
		})
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/statusz" => match state.report().map(|r| serde_json::to_vec(&r)) {
			Some(Ok(body)) => {
				let mut resp = respond(StatusCode::OK, body);
				resp.headers_mut()
					.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
				resp
			}
			Some(Err(e)) => {
				warn!(error = %e, "failed to encode status report");
				respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
			}
			None => respond(StatusCode::NOT_FOUND, Bytes::new()),
		},
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}
