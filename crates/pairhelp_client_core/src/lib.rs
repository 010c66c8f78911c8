#![forbid(unsafe_code)]

//! QUIC client for the pairhelp protocol.
//!
//! One bidirectional control stream carries both request/reply pairs and
//! server-pushed events. A background task decodes inbound frames; callers
//! pull them with [`ClientSession::recv`] or wait for a specific one with
//! [`ClientSession::recv_matching`] / [`ClientSession::request`].

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use pairhelp_protocol::{DEFAULT_MAX_FRAME_SIZE, Envelope, FramingError, Msg, encode_frame, try_decode_frame_from_buffer};
use quinn::{Endpoint, TransportConfig, VarInt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal); also the TLS server name.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Presence key sent in `hello`.
	pub contact_key: String,

	/// Bearer token for servers that require one.
	pub auth_token: Option<String>,

	/// Client identifier.
	pub client_name: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `quic://host:port` (or bare `host:port`) endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let invalid = |why: &str| ClientCoreError::Protocol(format!("invalid endpoint {endpoint:?} (expected quic://host:port): {why}"));

		let rest = endpoint.trim();
		let rest = rest.strip_prefix("quic://").unwrap_or(rest);
		let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		if host.is_empty() {
			return Err(invalid("missing host"));
		}
		let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
		Ok((host.to_string(), port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str, contact_key: impl Into<String>) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		let server_addr = format!("{host}:{port}").parse().ok();
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr,
			contact_key: contact_key.into(),
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18203,
			server_addr: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 18203))),
			contact_key: String::new(),
			auth_token: None,
			client_name: format!("pairhelp-client-core/{}", env!("CARGO_PKG_VERSION")),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
	pub server_name: String,
	pub server_time_unix_ms: i64,
	pub max_frame_bytes: u32,
	/// Whether the contact key already has a user record.
	pub registered: bool,
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered with `error{code, message}`.
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

	/// Nothing matching arrived in time.
	#[error("timed out after {0:?}")]
	Timeout(Duration),

	/// The control stream is gone.
	#[error("session closed")]
	Closed,

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// A connected, greeted session.
pub struct ClientSession {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	inbound: mpsc::UnboundedReceiver<Envelope>,
	backlog: VecDeque<Envelope>,
	reader: JoinHandle<()>,
	max_frame_bytes: usize,
	next_request_id: u64,
}

impl ClientSession {
	/// Connect and perform the `hello`/`welcome` handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;

		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (mut control_send, mut control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let hello = Envelope::request(
			"hello",
			Msg::Hello {
				contact_key: cfg.contact_key,
				auth_token: cfg.auth_token.unwrap_or_default(),
				client_name: cfg.client_name,
			},
		);
		write_envelope(&mut control_send, &hello, cfg.max_frame_bytes)
			.await
			.map_err(|e| ClientCoreError::Io(format!("send hello failed: {e}")))?;

		let mut buf = BytesMut::with_capacity(16 * 1024);
		let welcome_env = tokio::time::timeout(
			connect_timeout,
			read_one_envelope(&mut control_recv, &mut buf, cfg.max_frame_bytes),
		)
		.await
		.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for welcome after {connect_timeout:?}")))??;

		let welcome = match welcome_env.msg {
			Msg::Welcome {
				server_name,
				server_time_unix_ms,
				max_frame_bytes,
				registered,
			} => Welcome {
				server_name,
				server_time_unix_ms,
				max_frame_bytes,
				registered,
			},
			Msg::Error { code, message } => {
				conn.close(VarInt::from_u32(0), b"rejected");
				return Err(ClientCoreError::Server { code, message });
			}
			other => {
				return Err(ClientCoreError::Protocol(format!("expected welcome, got {}", other.kind())));
			}
		};

		debug!(
			server_name = %welcome.server_name,
			max_frame_bytes = welcome.max_frame_bytes,
			registered = welcome.registered,
			"received welcome"
		);

		let max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);
		let (inbound_tx, inbound) = mpsc::unbounded_channel();
		let reader = tokio::spawn(run_reader(control_recv, buf, max_frame_bytes, inbound_tx));

		let session = Self {
			conn,
			control_send,
			inbound,
			backlog: VecDeque::new(),
			reader,
			max_frame_bytes,
			next_request_id: 1,
		};

		Ok((session, welcome))
	}

	/// Send a request. Returns the request id its reply will echo.
	pub async fn send(&mut self, msg: Msg) -> Result<String, ClientCoreError> {
		let request_id = format!("r{}", self.next_request_id);
		self.next_request_id += 1;

		debug!(request_id = %request_id, kind = msg.kind(), "sending request");
		let env = Envelope::request(request_id.clone(), msg);
		write_envelope(&mut self.control_send, &env, self.max_frame_bytes).await?;
		Ok(request_id)
	}

	/// Send a message the caller built as raw JSON, unchecked against [`Msg`].
	/// The server answers malformed ones with an `INVALID_REQUEST` error.
	pub async fn send_value(&mut self, msg: serde_json::Value) -> Result<String, ClientCoreError> {
		let request_id = format!("r{}", self.next_request_id);
		self.next_request_id += 1;

		debug!(request_id = %request_id, "sending raw request");
		let body = serde_json::json!({
			"version": pairhelp_protocol::version::PROTOCOL_MAJOR,
			"request_id": request_id,
			"msg": msg,
		});
		let frame = encode_frame(&body, self.max_frame_bytes).map_err(ClientCoreError::Framing)?;
		self.control_send
			.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(request_id)
	}

	/// Next inbound envelope (reply or event), or `None` once the stream is closed.
	pub async fn recv(&mut self) -> Option<Envelope> {
		if let Some(env) = self.backlog.pop_front() {
			return Some(env);
		}
		self.inbound.recv().await
	}

	/// Wait for the first envelope matching `pred`. Others stay queued for `recv`.
	pub async fn recv_matching<F>(&mut self, mut pred: F, timeout: Duration) -> Result<Envelope, ClientCoreError>
	where
		F: FnMut(&Envelope) -> bool,
	{
		if let Some(pos) = self.backlog.iter().position(&mut pred) {
			return self.backlog.remove(pos).ok_or(ClientCoreError::Closed);
		}

		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let env = match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
				Ok(Some(env)) => env,
				Ok(None) => return Err(ClientCoreError::Closed),
				Err(_) => return Err(ClientCoreError::Timeout(timeout)),
			};
			if pred(&env) {
				return Ok(env);
			}
			self.backlog.push_back(env);
		}
	}

	/// Send `msg` and wait for its reply. A server `error` becomes [`ClientCoreError::Server`].
	pub async fn request(&mut self, msg: Msg, timeout: Duration) -> Result<Msg, ClientCoreError> {
		let request_id = self.send(msg).await?;
		let reply = self
			.recv_matching(|env| env.request_id == request_id, timeout)
			.await?;

		match reply.msg {
			Msg::Error { code, message } => Err(ClientCoreError::Server { code, message }),
			other => Ok(other),
		}
	}

	/// Send a keepalive ping and await the pong.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<i64, ClientCoreError> {
		match self
			.request(Msg::Ping { client_time_unix_ms }, Duration::from_secs(5))
			.await?
		{
			Msg::Pong {
				server_time_unix_ms, ..
			} => Ok(server_time_unix_ms),
			other => Err(ClientCoreError::Protocol(format!("expected pong, got {}", other.kind()))),
		}
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}
}

impl Drop for ClientSession {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

async fn run_reader(
	mut recv: quinn::RecvStream,
	mut buf: BytesMut,
	max_frame_bytes: usize,
	tx: mpsc::UnboundedSender<Envelope>,
) {
	let mut tmp = [0u8; 8192];

	loop {
		loop {
			match try_decode_frame_from_buffer::<Envelope>(&mut buf, max_frame_bytes) {
				Ok(Some(env)) => {
					if tx.send(env).is_err() {
						return;
					}
				}
				Ok(None) => break,
				Err(FramingError::Decode(e)) => warn!(error = %e, "skipping undecodable frame"),
				Err(e) => {
					warn!(error = %e, "control stream framing error");
					return;
				}
			}
		}

		match recv.read(&mut tmp).await {
			Ok(Some(n)) => buf.extend_from_slice(&tmp[..n]),
			Ok(None) => {
				info!("control stream closed");
				return;
			}
			Err(e) => {
				debug!(error = %e, "control stream read failed");
				return;
			}
		}
	}
}

async fn write_envelope(send: &mut quinn::SendStream, env: &Envelope, max_frame_bytes: usize) -> Result<(), ClientCoreError> {
	let frame = encode_frame(env, max_frame_bytes).map_err(ClientCoreError::Framing)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

async fn read_one_envelope(
	recv: &mut quinn::RecvStream,
	buf: &mut BytesMut,
	max_frame_bytes: usize,
) -> Result<Envelope, ClientCoreError> {
	let mut tmp = [0u8; 8192];

	loop {
		// Try decoding first in case buffer already has a full frame.
		match try_decode_frame_from_buffer::<Envelope>(buf, max_frame_bytes) {
			Ok(Some(env)) => return Ok(env),
			Ok(None) => {}
			Err(e) => return Err(ClientCoreError::Framing(e)),
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => {
				return Err(ClientCoreError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		};

		buf.extend_from_slice(&tmp[..n]);
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![pairhelp_protocol::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(8));
	transport.max_concurrent_uni_streams(VarInt::from_u32(8));
	transport.keep_alive_interval(Some(Duration::from_secs(10)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
