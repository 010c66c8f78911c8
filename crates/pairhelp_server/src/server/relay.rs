#![forbid(unsafe_code)]

//! Session relay: one scope per matched question, holding at most the author
//! and the helper. Events are forwarded to the peer and never echoed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pairhelp_domain::{ContactKey, HelperStats, Question, QuestionId, QuestionState};
use pairhelp_protocol::Msg;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::server::coordinator::MatchingSettings;
use crate::server::error::ServiceError;
use crate::server::presence::{ConnHandle, ConnId};
use crate::store::{RecordStore, StoreError, update_user_with_retry};

/// What a member tells its peer about itself on join.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Participant {
	pub display_name: String,
	pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JoinedSession {
	pub question: Question,
	pub peer_present: bool,
}

/// Result of a termination commit. The archive write and the helper update
/// are independent and fail independently.
#[derive(Debug)]
pub struct TerminationReport {
	pub question_id: QuestionId,
	pub archived: Result<(), StoreError>,
	pub helper_stats: Result<HelperStats, StoreError>,
}

impl TerminationReport {
	pub fn is_complete(&self) -> bool {
		self.archived.is_ok() && self.helper_stats.is_ok()
	}
}

#[derive(Debug, Clone, Copy)]
struct RelaySettings {
	answer_reward: u64,
	update_attempts: u32,
}

struct Member {
	handle: ConnHandle,
	info: Participant,
}

struct Scope {
	author: ContactKey,
	helper: ContactKey,
	members: HashMap<ContactKey, Member>,
	ending: bool,
}

impl Scope {
	fn peer_of(&self, who: &ContactKey) -> &ContactKey {
		if who == &self.author { &self.helper } else { &self.author }
	}

	fn is_member(&self, who: &ContactKey, conn_id: ConnId) -> bool {
		self.members
			.get(who)
			.is_some_and(|m| m.handle.conn_id() == conn_id)
	}

	fn deliver_to_peer(&self, from: &ContactKey, msg: Msg) -> bool {
		match self.members.get(self.peer_of(from)) {
			Some(peer) => peer.handle.deliver(msg),
			None => false,
		}
	}
}

#[derive(Clone)]
pub struct SessionRelay {
	inner: Arc<Inner>,
}

struct Inner {
	store: Arc<dyn RecordStore>,
	settings: RelaySettings,
	scopes: Mutex<HashMap<QuestionId, Scope>>,
	/// Questions whose termination commit has run. Locked after `scopes`.
	ended: Mutex<HashSet<QuestionId>>,
}

impl SessionRelay {
	pub fn new(store: Arc<dyn RecordStore>, settings: &MatchingSettings) -> Self {
		Self {
			inner: Arc::new(Inner {
				store,
				settings: RelaySettings {
					answer_reward: settings.answer_reward,
					update_attempts: settings.user_update_attempts.max(1),
				},
				scopes: Mutex::new(HashMap::new()),
				ended: Mutex::new(HashSet::new()),
			}),
		}
	}

	/// Join the scope of a matched question as its author or helper.
	pub async fn join(
		&self,
		question_id: QuestionId,
		who: &ContactKey,
		handle: ConnHandle,
		info: Participant,
	) -> Result<JoinedSession, ServiceError> {
		let Some(question) = self.inner.store.find_question_by_id(question_id).await? else {
			return Err(ServiceError::NotFound(format!("question {question_id}")));
		};

		if question.is_archived() {
			return Err(ServiceError::InvalidState(format!("question {question_id} is archived")));
		}
		if question.state != QuestionState::Matched {
			return Err(ServiceError::InvalidState(format!("question {question_id} has no helper yet")));
		}
		if !question.is_party(who) {
			return Err(ServiceError::Unauthorized(format!(
				"{who} is not a party to question {question_id}"
			)));
		}
		let Some(helper) = question.helper.clone() else {
			return Err(ServiceError::InvalidState(format!("question {question_id} has no helper yet")));
		};

		let mut scopes = self.inner.scopes.lock().await;
		// The record above may predate a termination that finished meanwhile.
		if self.inner.ended.lock().await.contains(&question_id) {
			return Err(ServiceError::InvalidState(format!("session {question_id} already ended")));
		}
		let scope = scopes.entry(question_id).or_insert_with(|| Scope {
			author: question.author.clone(),
			helper,
			members: HashMap::new(),
			ending: false,
		});

		if scope.ending {
			return Err(ServiceError::InvalidState(format!("session {question_id} is ending")));
		}

		let conn_id = handle.conn_id();
		let peer_info = scope
			.members
			.get(scope.peer_of(who))
			.map(|peer| peer.info.clone());
		let peer_present = peer_info.is_some();

		if let Some(peer_info) = peer_info {
			scope.deliver_to_peer(
				who,
				Msg::UserConnected {
					question_id,
					display_name: info.display_name.clone(),
					avatar_url: info.avatar_url.clone(),
				},
			);
			handle.deliver(Msg::UserConnected {
				question_id,
				display_name: peer_info.display_name,
				avatar_url: peer_info.avatar_url,
			});
		}

		if let Some(previous) = scope.members.insert(who.clone(), Member { handle, info }) {
			debug!(
				question_id = %question_id,
				member = %who,
				conn_id,
				superseded = previous.handle.conn_id(),
				"session member re-joined"
			);
		} else {
			info!(question_id = %question_id, member = %who, conn_id, peer_present, "session member joined");
		}
		metrics::gauge!("pairhelp_server_session_scopes").set(scopes.len() as f64);

		Ok(JoinedSession { question, peer_present })
	}

	pub async fn relay_chat(
		&self,
		question_id: QuestionId,
		from: &ContactKey,
		conn_id: ConnId,
		payload: Value,
	) -> Result<bool, ServiceError> {
		self.relay(question_id, from, conn_id, false, Msg::ChatReceived { question_id, payload })
			.await
	}

	pub async fn relay_editor(
		&self,
		question_id: QuestionId,
		from: &ContactKey,
		conn_id: ConnId,
		payload: Value,
	) -> Result<bool, ServiceError> {
		self.relay(question_id, from, conn_id, false, Msg::Update { question_id, payload })
			.await
	}

	/// Author asks the helper to wrap up with an answer.
	pub async fn end_request(
		&self,
		question_id: QuestionId,
		from: &ContactKey,
		conn_id: ConnId,
		payload: Value,
	) -> Result<bool, ServiceError> {
		self.relay(
			question_id,
			from,
			conn_id,
			true,
			Msg::AskHelperForAnswer { question_id, payload },
		)
		.await
	}

	async fn relay(
		&self,
		question_id: QuestionId,
		from: &ContactKey,
		conn_id: ConnId,
		author_only: bool,
		msg: Msg,
	) -> Result<bool, ServiceError> {
		let scopes = self.inner.scopes.lock().await;
		let scope = scopes
			.get(&question_id)
			.filter(|s| s.is_member(from, conn_id))
			.ok_or_else(|| ServiceError::Unauthorized(format!("{from} is not in session {question_id}")))?;

		if author_only && from != &scope.author {
			return Err(ServiceError::Unauthorized("only the author may request an answer".to_string()));
		}

		let kind = msg.kind();
		let delivered = scope.deliver_to_peer(from, msg);
		if delivered {
			metrics::counter!("pairhelp_server_relayed_total", "kind" => kind).increment(1);
		} else {
			debug!(question_id = %question_id, kind, "peer absent; relay dropped");
		}
		Ok(delivered)
	}

	/// Leave one scope. Returns whether `who` was a member on `conn_id`.
	pub async fn leave(&self, question_id: QuestionId, who: &ContactKey, conn_id: ConnId) -> bool {
		let mut scopes = self.inner.scopes.lock().await;
		let left = remove_member(&mut scopes, question_id, who, conn_id);
		metrics::gauge!("pairhelp_server_session_scopes").set(scopes.len() as f64);
		left
	}

	/// Remove every membership held by `conn_id`. Returns how many were dropped.
	pub async fn disconnect(&self, conn_id: ConnId) -> usize {
		let mut scopes = self.inner.scopes.lock().await;

		let held: Vec<(QuestionId, ContactKey)> = scopes
			.iter()
			.flat_map(|(qid, scope)| {
				scope
					.members
					.iter()
					.filter(|(_, m)| m.handle.conn_id() == conn_id)
					.map(|(key, _)| (*qid, key.clone()))
			})
			.collect();

		let mut dropped = 0;
		for (question_id, who) in held {
			if remove_member(&mut scopes, question_id, &who, conn_id) {
				dropped += 1;
			}
		}
		metrics::gauge!("pairhelp_server_session_scopes").set(scopes.len() as f64);
		dropped
	}

	/// Termination commit, once per scope.
	pub async fn end_chat(
		&self,
		question_id: QuestionId,
		who: &ContactKey,
		conn_id: ConnId,
		answer: Option<String>,
		rating: u32,
	) -> Result<TerminationReport, ServiceError> {
		let helper = {
			let mut scopes = self.inner.scopes.lock().await;
			let Some(scope) = scopes.get_mut(&question_id) else {
				drop(scopes);
				return Err(self.missing_scope_error(question_id, who).await);
			};
			if !scope.is_member(who, conn_id) {
				return Err(ServiceError::Unauthorized(format!("{who} is not in session {question_id}")));
			}
			if scope.ending {
				return Err(ServiceError::InvalidState(format!("session {question_id} is already ending")));
			}
			scope.ending = true;
			scope.helper.clone()
		};

		let answer = answer
			.map(|a| a.trim().to_string())
			.filter(|a| !a.is_empty());
		let answered = answer.is_some();

		let archived = match self.archive(question_id, answer).await {
			Ok(true) => Ok(()),
			Ok(false) => {
				warn!(question_id = %question_id, "question was archived elsewhere; helper not credited");
				self.close_scope(question_id, who).await;
				return Err(ServiceError::InvalidState(format!("session {question_id} already ended")));
			}
			Err(e) => {
				warn!(question_id = %question_id, error = %e, "failed to archive question");
				Err(e)
			}
		};

		let RelaySettings {
			answer_reward,
			update_attempts,
		} = self.inner.settings;
		let helper_stats = update_user_with_retry(&self.inner.store, &helper, update_attempts, |u| {
			u.helper_stats.record_session(rating, answered, answer_reward)
		})
		.await
		.map(|u| u.helper_stats);

		match &helper_stats {
			Ok(stats) => {
				debug!(
					question_id = %question_id,
					helper = %helper,
					helped = stats.helped,
					stars = stats.stars,
					level = %stats.level,
					"helper stats updated"
				);
			}
			Err(e) => {
				warn!(question_id = %question_id, helper = %helper, error = %e, "failed to update helper stats");
			}
		}

		self.close_scope(question_id, who).await;

		info!(
			question_id = %question_id,
			ended_by = %who,
			rating,
			answered,
			archived = archived.is_ok(),
			"session ended"
		);
		metrics::counter!("pairhelp_server_sessions_ended_total").increment(1);

		Ok(TerminationReport {
			question_id,
			archived,
			helper_stats,
		})
	}

	/// Drop the scope, tell the peer, and refuse any later join.
	async fn close_scope(&self, question_id: QuestionId, ended_by: &ContactKey) {
		let mut scopes = self.inner.scopes.lock().await;
		self.inner.ended.lock().await.insert(question_id);
		if let Some(scope) = scopes.remove(&question_id) {
			scope.deliver_to_peer(ended_by, Msg::EndChat { question_id });
		}
		metrics::gauge!("pairhelp_server_session_scopes").set(scopes.len() as f64);
	}

	/// Archive the question. `Ok(false)` when it was already archived.
	async fn archive(&self, question_id: QuestionId, answer: Option<String>) -> Result<bool, StoreError> {
		let attempts = self.inner.settings.update_attempts;
		let mut last_err = StoreError::NotFound;

		for attempt in 1..=attempts {
			let Some(mut question) = self.inner.store.find_question_by_id(question_id).await? else {
				return Err(StoreError::NotFound);
			};
			if question.is_archived() {
				return Ok(false);
			}

			question.state = QuestionState::Archived;
			question.answer = answer.clone();

			match self.inner.store.insert_or_update_question(&question).await {
				Ok(_) => return Ok(true),
				Err(e @ StoreError::Conflict { .. }) => {
					debug!(question_id = %question_id, attempt, error = %e, "archive conflicted; retrying");
					last_err = e;
				}
				Err(e) => return Err(e),
			}
		}

		Err(last_err)
	}

	async fn missing_scope_error(&self, question_id: QuestionId, who: &ContactKey) -> ServiceError {
		if self.inner.ended.lock().await.contains(&question_id) {
			return ServiceError::InvalidState(format!("session {question_id} already ended"));
		}
		match self.inner.store.find_question_by_id(question_id).await {
			Ok(Some(q)) if q.is_archived() => {
				ServiceError::InvalidState(format!("session {question_id} already ended"))
			}
			Ok(Some(_)) => ServiceError::Unauthorized(format!("{who} is not in session {question_id}")),
			Ok(None) => ServiceError::NotFound(format!("question {question_id}")),
			Err(e) => e.into(),
		}
	}

	pub async fn scope_count(&self) -> usize {
		self.inner.scopes.lock().await.len()
	}

	pub async fn member_count(&self, question_id: QuestionId) -> usize {
		self.inner
			.scopes
			.lock()
			.await
			.get(&question_id)
			.map(|s| s.members.len())
			.unwrap_or(0)
	}
}

fn remove_member(
	scopes: &mut HashMap<QuestionId, Scope>,
	question_id: QuestionId,
	who: &ContactKey,
	conn_id: ConnId,
) -> bool {
	let Some(scope) = scopes.get_mut(&question_id) else {
		return false;
	};
	if !scope.is_member(who, conn_id) {
		return false;
	}

	scope.members.remove(who);
	scope.deliver_to_peer(who, Msg::UserLeft { question_id });
	debug!(question_id = %question_id, member = %who, conn_id, "session member left");

	if scope.members.is_empty() && !scope.ending {
		scopes.remove(&question_id);
		debug!(question_id = %question_id, "session scope freed");
	}
	true
}
