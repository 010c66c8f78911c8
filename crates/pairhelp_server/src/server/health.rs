#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

/// Live counts served on `/statz`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
	pub online_users: usize,
	pub active_rounds: usize,
	pub session_scopes: usize,
}

#[async_trait::async_trait]
pub trait StatsSource: Send + Sync {
	async fn stats(&self) -> ServerStats;
}

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	stats: Option<Arc<dyn StatsSource>>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			stats: None,
		}
	}

	pub fn with_stats(mut self, source: Arc<dyn StatsSource>) -> Self {
		self.stats = Some(source);
		self
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	async fn stats(&self) -> ServerStats {
		match self.stats.as_ref() {
			Some(source) => source.stats().await,
			None => ServerStats::default(),
		}
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

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let path = req.uri().path();
	match path {
		"/healthz" => Ok(respond(StatusCode::OK, Bytes::from_static(b"ok"))),
		"/readyz" => {
			if state.is_ready() {
				Ok(respond(StatusCode::OK, Bytes::from_static(b"ready")))
			} else {
				Ok(respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")))
			}
		}
		"/statz" => {
			let stats = state.stats().await;
			match serde_json::to_vec(&stats) {
				Ok(body) => Ok(respond(StatusCode::OK, Bytes::from(body))),
				Err(err) => {
					warn!(error = %err, "failed to encode stats");
					Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()))
				}
			}
		}
		_ => Ok(respond(StatusCode::NOT_FOUND, Bytes::new())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Fixed;

	#[async_trait::async_trait]
	impl StatsSource for Fixed {
		async fn stats(&self) -> ServerStats {
			ServerStats {
				online_users: 3,
				active_rounds: 1,
				session_scopes: 2,
			}
		}
	}

	#[tokio::test]
	async fn stats_default_to_zero_without_source() {
		let state = HealthState::new();
		assert_eq!(state.stats().await, ServerStats::default());
		assert!(!state.is_ready());
		state.mark_ready();
		assert!(state.is_ready());
	}

	#[tokio::test]
	async fn stats_come_from_source() {
		let state = HealthState::new().with_stats(Arc::new(Fixed));
		let stats = state.stats().await;
		assert_eq!(stats.online_users, 3);

		let json = serde_json::to_value(stats).expect("json");
		assert_eq!(json["session_scopes"], 2);
	}
}
