#![forbid(unsafe_code)]

//! Matchmaking coordinator.
//!
//! Each search round is one task that owns the round's flags. Acceptances are
//! messages to that task and are applied in arrival order, so the first one
//! processed while the round is unsettled wins and every later one loses. The
//! deadline is a `sleep_until` branch of the same task; once a flag is set the
//! deadline is never polled again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pairhelp_domain::{ContactKey, DEFAULT_ANSWER_REWARD, Question, QuestionId, QuestionState};
use pairhelp_protocol::{InvitationOutcome, Msg, SearchStatus};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::server::error::ServiceError;
use crate::server::presence::PresenceRegistry;
use crate::store::{RecordStore, UserFilter};

/// Matching knobs (the `[matching]` config section).
#[derive(Debug, Clone)]
pub struct MatchingSettings {
	/// How long a round may search before it times out.
	pub search_timeout: Duration,
	/// Maximum candidates fetched per round.
	pub candidate_limit: usize,
	/// Stars added to a helper when a session ends with an answer.
	pub answer_reward: u64,
	/// Attempts for user read-modify-write cycles that hit revision conflicts.
	pub user_update_attempts: u32,
	/// Queued acceptances per round before senders wait.
	pub round_inbox_capacity: usize,
}

impl Default for MatchingSettings {
	fn default() -> Self {
		Self {
			search_timeout: Duration::from_secs(120),
			candidate_limit: 10,
			answer_reward: DEFAULT_ANSWER_REWARD,
			user_update_attempts: 3,
			round_inbox_capacity: 64,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
	QueryFailed,
	NoCandidates,
	PersistFailed,
}

/// Terminal state of a round, published on the outcome channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
	Matched {
		question_id: QuestionId,
		helper: ContactKey,
	},
	TimedOut {
		question_id: QuestionId,
	},
	Abandoned {
		question_id: QuestionId,
		reason: AbandonReason,
	},
}

impl RoundOutcome {
	pub fn question_id(&self) -> QuestionId {
		match self {
			RoundOutcome::Matched { question_id, .. }
			| RoundOutcome::TimedOut { question_id }
			| RoundOutcome::Abandoned { question_id, .. } => *question_id,
		}
	}
}

struct Answer {
	helper: ContactKey,
	helper_name: String,
	accepted: bool,
	reply: oneshot::Sender<Result<InvitationOutcome, ServiceError>>,
}

struct RoundEntry {
	round_id: u64,
	tx: mpsc::Sender<Answer>,
}

#[derive(Clone)]
pub struct MatchCoordinator {
	inner: Arc<Inner>,
}

struct Inner {
	store: Arc<dyn RecordStore>,
	presence: PresenceRegistry,
	settings: MatchingSettings,
	rounds: Mutex<HashMap<QuestionId, RoundEntry>>,
	next_round_id: AtomicU64,
	outcomes: broadcast::Sender<RoundOutcome>,
}

impl Inner {
	async fn remove_round(&self, question_id: QuestionId, round_id: u64) {
		let mut rounds = self.rounds.lock().await;
		if rounds.get(&question_id).is_some_and(|e| e.round_id == round_id) {
			rounds.remove(&question_id);
		}
		metrics::gauge!("pairhelp_server_active_rounds").set(rounds.len() as f64);
	}

	async fn deliver_to(&self, key: &ContactKey, msg: Msg) -> bool {
		match self.presence.lookup(key).await {
			Some(handle) => handle.deliver(msg),
			None => false,
		}
	}
}

impl MatchCoordinator {
	pub fn new(store: Arc<dyn RecordStore>, presence: PresenceRegistry, settings: MatchingSettings) -> Self {
		let (outcomes, _) = broadcast::channel(64);
		Self {
			inner: Arc::new(Inner {
				store,
				presence,
				settings,
				rounds: Mutex::new(HashMap::new()),
				next_round_id: AtomicU64::new(1),
				outcomes,
			}),
		}
	}

	/// Start a search round for `question_id` on behalf of its author.
	pub async fn request_help(&self, author: &ContactKey, question_id: QuestionId) -> Result<SearchStatus, ServiceError> {
		let Some(mut question) = self.inner.store.find_question_by_id(question_id).await? else {
			return Err(ServiceError::NotFound(format!("question {question_id}")));
		};

		if question.state == QuestionState::Archived {
			return Ok(SearchStatus::Archived);
		}
		if &question.author != author {
			return Err(ServiceError::Unauthorized("only the author may request help".to_string()));
		}
		if question.state == QuestionState::Matched {
			return Ok(SearchStatus::AlreadyMatched);
		}

		let round_id = self.inner.next_round_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(self.inner.settings.round_inbox_capacity.max(1));
		{
			let mut rounds = self.inner.rounds.lock().await;
			if rounds.get(&question_id).is_some_and(|e| !e.tx.is_closed()) {
				debug!(question_id = %question_id, "search already live");
				return Ok(SearchStatus::Searching);
			}
			rounds.insert(question_id, RoundEntry { round_id, tx });
			metrics::gauge!("pairhelp_server_active_rounds").set(rounds.len() as f64);
		}
		let deadline = Instant::now() + self.inner.settings.search_timeout;

		question.state = QuestionState::Matching;
		match self.inner.store.insert_or_update_question(&question).await {
			Ok(stored) => question.rev = stored.rev,
			Err(e) => {
				warn!(question_id = %question_id, error = %e, "failed to persist matching state");
				self.inner.remove_round(question_id, round_id).await;
				return Err(e.into());
			}
		}

		info!(
			question_id = %question_id,
			author = %author,
			skill_tag = %question.skill_tag,
			timeout_secs = self.inner.settings.search_timeout.as_secs(),
			"search round started"
		);
		metrics::counter!("pairhelp_server_rounds_started_total").increment(1);

		let round = Round {
			inner: Arc::clone(&self.inner),
			round_id,
			question,
			deadline,
			rx,
			invited: HashSet::new(),
			found: false,
			timed_out: false,
			abandoned: false,
		};
		tokio::spawn(round.run());

		Ok(SearchStatus::Searching)
	}

	/// Route a helper's answer to the live round, if any.
	pub async fn answer_invitation(
		&self,
		helper: &ContactKey,
		helper_name: &str,
		question_id: QuestionId,
		accepted: bool,
	) -> Result<InvitationOutcome, ServiceError> {
		let tx = {
			let rounds = self.inner.rounds.lock().await;
			rounds.get(&question_id).map(|e| e.tx.clone())
		};

		if let Some(tx) = tx {
			let helper_name = if helper_name.trim().is_empty() {
				helper.to_string()
			} else {
				helper_name.trim().to_string()
			};
			let (reply, reply_rx) = oneshot::channel();
			let answer = Answer {
				helper: helper.clone(),
				helper_name,
				accepted,
				reply,
			};
			if tx.send(answer).await.is_ok()
				&& let Ok(result) = reply_rx.await
			{
				return result;
			}
		}

		if !accepted {
			return Ok(InvitationOutcome::Declined);
		}

		debug!(question_id = %question_id, helper = %helper, "acceptance without a live round");
		metrics::counter!("pairhelp_server_acceptances_lost_total").increment(1);
		self.inner
			.deliver_to(helper, Msg::AlreadyAccepted { question_id })
			.await;
		Ok(InvitationOutcome::RaceLost)
	}

	pub fn subscribe_outcomes(&self) -> broadcast::Receiver<RoundOutcome> {
		self.inner.outcomes.subscribe()
	}

	pub async fn active_rounds(&self) -> usize {
		self.inner.rounds.lock().await.len()
	}

	pub async fn is_searching(&self, question_id: QuestionId) -> bool {
		self.inner.rounds.lock().await.contains_key(&question_id)
	}

	pub fn settings(&self) -> &MatchingSettings {
		&self.inner.settings
	}
}

enum Settled {
	Matched(ContactKey),
	TimedOut,
	Abandoned(AbandonReason),
}

struct Round {
	inner: Arc<Inner>,
	round_id: u64,
	question: Question,
	deadline: Instant,
	rx: mpsc::Receiver<Answer>,
	invited: HashSet<ContactKey>,
	found: bool,
	timed_out: bool,
	abandoned: bool,
}

impl Round {
	async fn run(mut self) {
		let settled = self.search().await;
		self.settle(settled).await;
	}

	fn is_settled(&self) -> bool {
		self.found || self.timed_out || self.abandoned
	}

	async fn search(&mut self) -> Settled {
		let question_id = self.question.id;
		let sleep = sleep_until(self.deadline);
		tokio::pin!(sleep);

		let filter = UserFilter {
			skill_tag: self.question.skill_tag.clone(),
			online: true,
		};
		let store = Arc::clone(&self.inner.store);
		let limit = self.inner.settings.candidate_limit;

		let candidates = tokio::select! {
			biased;
			_ = &mut sleep => return Settled::TimedOut,
			res = store.find_users(&filter, limit) => res,
		};

		let candidates = match candidates {
			Ok(c) => c,
			Err(e) => {
				warn!(question_id = %question_id, error = %e, "candidate query failed");
				return Settled::Abandoned(AbandonReason::QueryFailed);
			}
		};

		let candidates: Vec<ContactKey> = candidates
			.into_iter()
			.map(|c| c.contact_key)
			.filter(|key| key != &self.question.author)
			.collect();

		if candidates.is_empty() {
			debug!(question_id = %question_id, "no online candidates");
			return Settled::Abandoned(AbandonReason::NoCandidates);
		}

		for candidate in candidates {
			if let Some(settled) = self.drain_inbox().await {
				return settled;
			}
			if Instant::now() >= self.deadline {
				return Settled::TimedOut;
			}

			let Some(handle) = self.inner.presence.lookup(&candidate).await else {
				debug!(question_id = %question_id, candidate = %candidate, "candidate not connected; skipped");
				continue;
			};

			if handle.deliver(Msg::AskHelp {
				question: self.question.clone(),
			}) {
				debug!(question_id = %question_id, candidate = %candidate, "invitation sent");
				metrics::counter!("pairhelp_server_invitations_sent_total").increment(1);
				self.invited.insert(candidate);
			}
		}

		if let Some(settled) = self.drain_inbox().await {
			return settled;
		}

		if self.invited.is_empty() {
			debug!(question_id = %question_id, "no candidate reachable; waiting out the deadline");
		}

		loop {
			tokio::select! {
				biased;
				answer = self.rx.recv() => match answer {
					Some(answer) => {
						if let Some(settled) = self.on_answer(answer).await {
							return settled;
						}
					}
					None => {
						(&mut sleep).await;
						return Settled::TimedOut;
					}
				},
				_ = &mut sleep => return Settled::TimedOut,
			}
		}
	}

	async fn drain_inbox(&mut self) -> Option<Settled> {
		while let Ok(answer) = self.rx.try_recv() {
			if let Some(settled) = self.on_answer(answer).await {
				return Some(settled);
			}
		}
		None
	}

	/// Apply one answer. Returns `Some` when it settled the round.
	async fn on_answer(&mut self, answer: Answer) -> Option<Settled> {
		let Answer {
			helper,
			helper_name,
			accepted,
			reply,
		} = answer;
		let question_id = self.question.id;

		if !accepted {
			debug!(question_id = %question_id, helper = %helper, "invitation declined");
			let _ = reply.send(Ok(InvitationOutcome::Declined));
			return None;
		}

		if !self.invited.contains(&helper) {
			warn!(question_id = %question_id, helper = %helper, "acceptance from an identity that was not invited");
			let _ = reply.send(Err(ServiceError::Unauthorized(format!(
				"{helper} was not invited to question {question_id}"
			))));
			return None;
		}

		if self.is_settled() {
			debug!(question_id = %question_id, helper = %helper, "late acceptance; already settled");
			metrics::counter!("pairhelp_server_acceptances_lost_total").increment(1);
			self.inner
				.deliver_to(&helper, Msg::AlreadyAccepted { question_id })
				.await;
			let _ = reply.send(Ok(InvitationOutcome::RaceLost));
			return None;
		}

		self.found = true;
		Some(self.commit(helper, helper_name, reply).await)
	}

	async fn commit(
		&mut self,
		helper: ContactKey,
		helper_name: String,
		reply: oneshot::Sender<Result<InvitationOutcome, ServiceError>>,
	) -> Settled {
		let question_id = self.question.id;

		let mut matched = self.question.clone();
		matched.state = QuestionState::Matched;
		matched.helper = Some(helper.clone());
		matched.helper_name = Some(helper_name);

		match self.inner.store.insert_or_update_question(&matched).await {
			Ok(stored) => {
				matched.rev = stored.rev;
				self.question = matched;
			}
			Err(e) => {
				warn!(question_id = %question_id, helper = %helper, error = %e, "failed to persist match");
				self.inner
					.deliver_to(&helper, Msg::AlreadyAccepted { question_id })
					.await;
				let _ = reply.send(Ok(InvitationOutcome::RaceLost));
				return Settled::Abandoned(AbandonReason::PersistFailed);
			}
		}

		match self.inner.presence.lookup(&self.question.author).await {
			Some(author) => {
				author.deliver(Msg::HelperFound { question_id });
				self.inner.deliver_to(&helper, Msg::Accept { question_id }).await;
				let _ = reply.send(Ok(InvitationOutcome::Won));
			}
			None => {
				info!(question_id = %question_id, helper = %helper, "author gone at commit");
				self.inner
					.deliver_to(&helper, Msg::AlreadyAccepted { question_id })
					.await;
				let _ = reply.send(Ok(InvitationOutcome::RaceLost));
			}
		}

		Settled::Matched(helper)
	}

	async fn settle(mut self, settled: Settled) {
		let question_id = self.question.id;
		let author = self.question.author.clone();

		let outcome = match settled {
			Settled::Matched(helper) => {
				info!(question_id = %question_id, helper = %helper, "search round matched");
				metrics::counter!("pairhelp_server_rounds_matched_total").increment(1);
				RoundOutcome::Matched { question_id, helper }
			}
			Settled::TimedOut => {
				self.timed_out = true;
				info!(question_id = %question_id, "search round timed out");
				metrics::counter!("pairhelp_server_rounds_timed_out_total").increment(1);

				self.inner.deliver_to(&author, Msg::Timeout { question_id }).await;
				if let Err(e) = self
					.inner
					.store
					.delete_question(question_id, self.question.rev)
					.await
				{
					warn!(question_id = %question_id, error = %e, "failed to delete timed-out question");
				}
				RoundOutcome::TimedOut { question_id }
			}
			Settled::Abandoned(reason) => {
				self.abandoned = true;
				info!(question_id = %question_id, ?reason, "search round abandoned");
				metrics::counter!("pairhelp_server_rounds_abandoned_total").increment(1);

				self.inner
					.deliver_to(&author, Msg::ErrorWhileFinding { question_id })
					.await;

				let mut reset = self.question.clone();
				reset.state = QuestionState::Open;
				if let Err(e) = self.inner.store.insert_or_update_question(&reset).await {
					warn!(question_id = %question_id, error = %e, "failed to reopen abandoned question");
				}
				RoundOutcome::Abandoned { question_id, reason }
			}
		};

		self.inner.remove_round(question_id, self.round_id).await;
		self.rx.close();
		while let Some(answer) = self.rx.recv().await {
			let _ = self.on_answer(answer).await;
		}

		let _ = self.inner.outcomes.send(outcome);
	}
}
