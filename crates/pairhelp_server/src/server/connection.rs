#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use pairhelp_domain::{ContactKey, QuestionDraft, QuestionId, SkillTag, UserId};
use pairhelp_protocol::{DEFAULT_MAX_FRAME_SIZE, Envelope, FramingError, MalformedEnvelope, Msg, codes, encode_frame};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SecretString;
use crate::server::auth::verify_hmac_token;
use crate::server::coordinator::{MatchCoordinator, MatchingSettings};
use crate::server::error::ServiceError;
use crate::server::health::{ServerStats, StatsSource};
use crate::server::presence::{ConnHandle, ConnId, PresenceRegistry};
use crate::server::questions::{QuestionService, parse_skill_tags, profile_of};
use crate::server::relay::{Participant, SessionRelay};
use crate::store::RecordStore;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	/// Bounded outbound queue per connection; pushed events are dropped when full.
	pub outbound_queue_capacity: usize,

	/// How long a fresh connection may take to send `hello`.
	pub hello_timeout: Duration,

	pub auth_hmac_secret: Option<SecretString>,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			outbound_queue_capacity: 256,
			hello_timeout: Duration::from_secs(10),
			auth_hmac_secret: None,
		}
	}
}

/// Everything a connection handler needs.
#[derive(Clone)]
pub struct ServerContext {
	pub store: Arc<dyn RecordStore>,
	pub presence: PresenceRegistry,
	pub coordinator: MatchCoordinator,
	pub relay: SessionRelay,
	pub questions: QuestionService,
	pub settings: ConnectionSettings,
}

impl ServerContext {
	/// Wire up the services over one store. Requires a tokio runtime.
	pub fn new(store: Arc<dyn RecordStore>, matching: MatchingSettings, settings: ConnectionSettings) -> Self {
		let presence = PresenceRegistry::new(Arc::clone(&store));
		let relay = SessionRelay::new(Arc::clone(&store), &matching);
		let questions = QuestionService::new(Arc::clone(&store), matching.user_update_attempts);
		let coordinator = MatchCoordinator::new(Arc::clone(&store), presence.clone(), matching);

		Self {
			store,
			presence,
			coordinator,
			relay,
			questions,
			settings,
		}
	}
}

#[async_trait::async_trait]
impl StatsSource for ServerContext {
	async fn stats(&self) -> ServerStats {
		ServerStats {
			online_users: self.presence.online_count().await,
			active_rounds: self.coordinator.active_rounds().await,
			session_scopes: self.relay.scope_count().await,
		}
	}
}

/// Accept loop. Returns when the endpoint is closed.
pub async fn serve(endpoint: quinn::Endpoint, ctx: ServerContext) {
	let mut next_conn_id: ConnId = 1;

	while let Some(incoming) = endpoint.accept().await {
		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("pairhelp_server_connections_total").increment(1);

		let ctx = ctx.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, ctx).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}
}

struct Hello {
	request_id: String,
	contact_key: String,
	auth_token: String,
	client_name: String,
}

/// One decoded control frame.
enum Inbound {
	Envelope(Envelope),
	Malformed(MalformedEnvelope),
}

/// The authenticated side of one connection.
struct Session {
	conn_id: ConnId,
	key: ContactKey,
	handle: ConnHandle,
}

pub async fn handle_connection(conn_id: ConnId, connection: quinn::Connection, ctx: ServerContext) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("pairhelp_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("pairhelp_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let settings = ctx.settings.clone();
	let max_frame = settings.max_frame_bytes as usize;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Inbound>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("pairhelp_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match pairhelp_protocol::try_decode_frame_from_buffer::<Value>(&mut buf, max_frame) {
					Ok(Some(body)) => {
						metrics::counter!("pairhelp_server_envelopes_in_total").increment(1);
						let inbound = match Envelope::from_value(body) {
							Ok(env) => Inbound::Envelope(env),
							Err(malformed) => {
								metrics::counter!("pairhelp_server_control_decode_errors_total").increment(1);
								Inbound::Malformed(malformed)
							}
						};
						if in_tx.send(inbound).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(FramingError::Decode(e)) => {
						metrics::counter!("pairhelp_server_control_decode_errors_total").increment(1);
						warn!(conn_id, error = %e, "skipping control frame that is not JSON");
					}
					Err(e) => {
						metrics::counter!("pairhelp_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let hello = match tokio::time::timeout(settings.hello_timeout, wait_for_hello(&mut in_rx)).await {
		Ok(hello) => hello?,
		Err(_) => {
			reader_task.abort();
			return Err(anyhow!("no hello within {:?}", settings.hello_timeout));
		}
	};

	info!(conn_id, client_name = %hello.client_name, "received hello");
	metrics::counter!("pairhelp_server_hello_total").increment(1);

	let key = match ContactKey::new(&hello.contact_key) {
		Ok(key) => key,
		Err(e) => {
			warn!(conn_id, error = %e, "hello with invalid contact key");
			let reply = Envelope::request(
				hello.request_id,
				Msg::error(codes::INVALID_REQUEST, format!("invalid contact key: {e}")),
			);
			reject(&connection, &mut control_send, &reply, max_frame).await;
			reader_task.abort();
			return Ok(());
		}
	};

	if let Some(secret) = settings.auth_hmac_secret.as_ref() {
		let authorized = match verify_hmac_token(hello.auth_token.trim(), secret.expose()) {
			Ok(claims) => {
				let sub_matches = ContactKey::new(&claims.sub).is_ok_and(|sub| sub == key);
				if !sub_matches {
					warn!(conn_id, contact_key = %key, "auth token subject does not match contact key");
				}
				sub_matches
			}
			Err(e) => {
				warn!(conn_id, contact_key = %key, error = %e, "auth token rejected");
				false
			}
		};

		if !authorized {
			metrics::counter!("pairhelp_server_auth_failures_total").increment(1);
			let reply = Envelope::request(hello.request_id, Msg::error(codes::UNAUTHORIZED, "invalid auth token"));
			reject(&connection, &mut control_send, &reply, max_frame).await;
			reader_task.abort();
			return Ok(());
		}
	}

	let registered = match ctx.questions.user_by_key(&key).await {
		Ok(user) => user.is_some(),
		Err(e) => {
			warn!(conn_id, contact_key = %key, error = %e, "user lookup failed during hello");
			false
		}
	};

	let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(settings.outbound_queue_capacity.max(1));
	let writer_task = tokio::spawn(async move {
		while let Some(env) = out_rx.recv().await {
			send_envelope(&mut control_send, &env, max_frame).await?;
		}
		let _ = control_send.finish();
		Ok::<(), anyhow::Error>(())
	});

	let session = Session {
		conn_id,
		key: key.clone(),
		handle: ConnHandle::new(conn_id, out_tx.clone()),
	};

	let welcome = Envelope::request(
		hello.request_id,
		Msg::Welcome {
			server_name: format!("pairhelp-server/{}", env!("CARGO_PKG_VERSION")),
			server_time_unix_ms: unix_ms_now(),
			max_frame_bytes: settings.max_frame_bytes,
			registered,
		},
	);
	out_tx.send(welcome).await.map_err(|_| anyhow!("writer closed before welcome"))?;

	if let Some(previous) = ctx.presence.register(key.clone(), session.handle.clone()).await {
		debug!(conn_id, contact_key = %key, superseded = previous.conn_id(), "replaced stale presence binding");
	}

	while let Some(inbound) = in_rx.recv().await {
		let env = match inbound {
			Inbound::Envelope(env) => env,
			Inbound::Malformed(MalformedEnvelope { request_id, reason }) => {
				debug!(conn_id, request_id = %request_id, reason = %reason, "malformed request");
				metrics::counter!("pairhelp_server_request_errors_total", "code" => codes::INVALID_REQUEST).increment(1);
				let reply = Msg::error(codes::INVALID_REQUEST, format!("malformed request: {reason}"));
				if out_tx.send(Envelope::request(request_id, reply)).await.is_err() {
					break;
				}
				continue;
			}
		};
		let Envelope { request_id, msg, .. } = env;
		let kind = msg.kind();
		metrics::counter!("pairhelp_server_requests_total", "kind" => kind).increment(1);

		let reply = match handle_request(&ctx, &session, msg).await {
			Ok(Some(reply)) => reply,
			Ok(None) => continue,
			Err(e) => {
				debug!(conn_id, kind, code = e.code(), error = %e, "request failed");
				metrics::counter!("pairhelp_server_request_errors_total", "code" => e.code()).increment(1);
				e.to_msg()
			}
		};

		if out_tx.send(Envelope::request(request_id, reply)).await.is_err() {
			break;
		}
	}

	// Departure is immediate; the online-flag write is queued by `release`.
	ctx.presence.release(&key, conn_id).await;
	let left = ctx.relay.disconnect(conn_id).await;
	info!(conn_id, contact_key = %key, sessions_left = left, "connection closed");

	drop(session);
	drop(out_tx);
	match tokio::time::timeout(Duration::from_secs(2), writer_task).await {
		Ok(Ok(Err(e))) => debug!(conn_id, error = %e, "writer finished with error"),
		Ok(_) => {}
		Err(_) => debug!(conn_id, "writer did not drain in time"),
	}
	reader_task.abort();

	Ok(())
}

/// Send a final error and give the peer a moment to read it and close.
async fn reject(connection: &quinn::Connection, send: &mut quinn::SendStream, reply: &Envelope, max_frame: usize) {
	if send_envelope(send, reply, max_frame).await.is_ok() {
		let _ = send.finish();
	}
	let _ = tokio::time::timeout(Duration::from_secs(2), connection.closed()).await;
}

async fn wait_for_hello(in_rx: &mut mpsc::UnboundedReceiver<Inbound>) -> anyhow::Result<Hello> {
	while let Some(inbound) = in_rx.recv().await {
		let env = match inbound {
			Inbound::Envelope(env) => env,
			Inbound::Malformed(malformed) => {
				debug!(error = %malformed, "ignoring malformed frame before hello");
				continue;
			}
		};
		match env.msg {
			Msg::Hello {
				contact_key,
				auth_token,
				client_name,
			} => {
				return Ok(Hello {
					request_id: env.request_id,
					contact_key,
					auth_token,
					client_name,
				});
			}
			other => debug!(kind = other.kind(), "ignoring message before hello"),
		}
	}
	Err(anyhow!("connection closed before hello"))
}

fn parse_question_id(raw: &str) -> Result<QuestionId, ServiceError> {
	raw.parse()
		.map_err(|e| ServiceError::InvalidRequest(format!("invalid question id {raw:?}: {e}")))
}

fn non_empty_or(value: String, fallback: &ContactKey) -> String {
	let value = value.trim();
	if value.is_empty() {
		fallback.to_string()
	} else {
		value.to_string()
	}
}

async fn handle_request(ctx: &ServerContext, session: &Session, msg: Msg) -> Result<Option<Msg>, ServiceError> {
	let key = &session.key;
	let conn_id = session.conn_id;

	match msg {
		Msg::Hello { .. } => {
			debug!(conn_id, "ignoring duplicate hello");
			Ok(None)
		}

		Msg::Ping { client_time_unix_ms } => Ok(Some(Msg::Pong {
			client_time_unix_ms,
			server_time_unix_ms: unix_ms_now(),
		})),

		Msg::RegisterProfile {
			display_name,
			skill_tags,
			avatar_url,
		} => {
			let tags = parse_skill_tags(&skill_tags)?;
			let user = ctx
				.questions
				.register_profile(key, &display_name, tags, avatar_url, true)
				.await?;
			Ok(Some(Msg::ProfileSaved {
				profile: profile_of(&user),
			}))
		}

		Msg::SubmitQuestion {
			title,
			details,
			code,
			skill_tag,
		} => {
			let skill_tag = SkillTag::new(&skill_tag)
				.map_err(|e| ServiceError::InvalidRequest(format!("invalid skill tag {skill_tag:?}: {e}")))?;
			let question = ctx
				.questions
				.submit(
					key,
					QuestionDraft {
						title: title.trim().to_string(),
						details,
						code,
						skill_tag,
					},
				)
				.await?;
			Ok(Some(Msg::QuestionSubmitted { question }))
		}

		Msg::FindHelper { question_id } => {
			let question_id = parse_question_id(&question_id)?;
			let status = ctx.coordinator.request_help(key, question_id).await?;
			Ok(Some(Msg::SearchStarted { question_id, status }))
		}

		Msg::AnswerInvitation {
			question_id,
			accepted,
			display_name,
		} => {
			let question_id = parse_question_id(&question_id)?;
			let display_name = if display_name.trim().is_empty() {
				ctx.questions
					.user_by_key(key)
					.await
					.ok()
					.flatten()
					.map(|u| u.display_name)
					.unwrap_or_default()
			} else {
				display_name
			};
			let outcome = ctx
				.coordinator
				.answer_invitation(key, &display_name, question_id, accepted)
				.await?;
			Ok(Some(Msg::InvitationAnswered { question_id, outcome }))
		}

		Msg::JoinSession {
			question_id,
			display_name,
			avatar_url,
		} => {
			let question_id = parse_question_id(&question_id)?;
			let info = Participant {
				display_name: non_empty_or(display_name, key),
				avatar_url: avatar_url.filter(|a| !a.trim().is_empty()),
			};
			let joined = ctx
				.relay
				.join(question_id, key, session.handle.clone(), info)
				.await?;
			Ok(Some(Msg::SessionJoined {
				question: joined.question,
				peer_present: joined.peer_present,
			}))
		}

		Msg::ChatSend { question_id, payload } => {
			let question_id = parse_question_id(&question_id)?;
			ctx.relay.relay_chat(question_id, key, conn_id, payload).await?;
			Ok(None)
		}

		Msg::UpdateEditor { question_id, payload } => {
			let question_id = parse_question_id(&question_id)?;
			ctx.relay.relay_editor(question_id, key, conn_id, payload).await?;
			Ok(None)
		}

		Msg::EndRequest { question_id, payload } => {
			let question_id = parse_question_id(&question_id)?;
			ctx.relay.end_request(question_id, key, conn_id, payload).await?;
			Ok(None)
		}

		Msg::ChatEnded {
			question_id,
			answer,
			rating,
		} => {
			let question_id = parse_question_id(&question_id)?;
			let report = ctx
				.relay
				.end_chat(question_id, key, conn_id, answer, rating)
				.await?;
			Ok(Some(Msg::SessionEnded {
				question_id,
				archived: report.archived.is_ok(),
				helper_stats_updated: report.helper_stats.is_ok(),
			}))
		}

		Msg::LeaveSession { question_id } => {
			let question_id = parse_question_id(&question_id)?;
			ctx.relay.leave(question_id, key, conn_id).await;
			Ok(None)
		}

		Msg::ListQuestions { page_token } => {
			let Some(user) = ctx.questions.user_by_key(key).await? else {
				return Err(ServiceError::NotFound(format!("user {key}")));
			};
			let (questions, next_page_token) = ctx
				.questions
				.list_by_author(user.id, page_token.as_deref())
				.await?;
			Ok(Some(Msg::QuestionPage {
				questions,
				next_page_token,
			}))
		}

		Msg::ViewQuestion { question_id } => {
			let question_id = parse_question_id(&question_id)?;
			let view = ctx.questions.view(question_id).await?;
			Ok(Some(Msg::QuestionView { view }))
		}

		Msg::GetProfile { user_id } => {
			let user_id: UserId = user_id
				.parse()
				.map_err(|e| ServiceError::InvalidRequest(format!("invalid user id {user_id:?}: {e}")))?;
			let profile = ctx.questions.profile(user_id).await?;
			Ok(Some(Msg::Profile { profile }))
		}

		other => Err(ServiceError::InvalidRequest(format!(
			"{} is not a client request",
			other.kind()
		))),
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: &Envelope, max_frame: usize) -> anyhow::Result<()> {
	let frame = encode_frame(env, max_frame).map_err(|e| anyhow!(e))?;
	metrics::counter!("pairhelp_server_envelopes_out_total").increment(1);
	metrics::counter!("pairhelp_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
