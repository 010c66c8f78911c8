#![forbid(unsafe_code)]

use std::sync::Arc;

use pairhelp_domain::{ContactKey, Question, QuestionDraft, QuestionId, SkillTag, User, UserId};
use pairhelp_protocol::{ArchivedQuestion, QuestionSummary, UserProfile};
use tracing::{debug, info};

use crate::server::error::ServiceError;
use crate::store::{PageToken, QUESTION_PAGE_SIZE, RecordStore, StoreError, update_user_with_retry};
use crate::util::time::unix_ms_now;

/// Shown in place of a missing answer on archived questions.
pub const NO_ANSWER_PLACEHOLDER: &str = "No answer provided";

/// Profiles, question submission and question history.
#[derive(Clone)]
pub struct QuestionService {
	store: Arc<dyn RecordStore>,
	update_attempts: u32,
}

pub fn profile_of(user: &User) -> UserProfile {
	UserProfile {
		id: user.id,
		display_name: user.display_name.clone(),
		avatar_url: user.avatar_url.clone(),
		skill_tags: user.skill_tags.clone(),
		helper_stats: user.helper_stats,
	}
}

/// Parse, normalize and dedupe skill tags, keeping first-seen order.
pub fn parse_skill_tags<I, S>(raw: I) -> Result<Vec<SkillTag>, ServiceError>
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	let mut tags: Vec<SkillTag> = Vec::new();
	for t in raw {
		let tag = SkillTag::new(t.as_ref())
			.map_err(|e| ServiceError::InvalidRequest(format!("invalid skill tag {:?}: {e}", t.as_ref())))?;
		if !tags.contains(&tag) {
			tags.push(tag);
		}
	}
	Ok(tags)
}

impl QuestionService {
	pub fn new(store: Arc<dyn RecordStore>, update_attempts: u32) -> Self {
		Self {
			store,
			update_attempts: update_attempts.max(1),
		}
	}

	/// Create or update the caller's user record.
	pub async fn register_profile(
		&self,
		key: &ContactKey,
		display_name: &str,
		skill_tags: Vec<SkillTag>,
		avatar_url: Option<String>,
		online: bool,
	) -> Result<User, ServiceError> {
		let display_name = display_name.trim();
		if display_name.is_empty() {
			return Err(ServiceError::InvalidRequest("display name is required".to_string()));
		}
		let avatar_url = avatar_url.filter(|a| !a.trim().is_empty());

		let updated = update_user_with_retry(&self.store, key, self.update_attempts, |u| {
			u.display_name = display_name.to_string();
			u.skill_tags = skill_tags.clone();
			u.avatar_url = avatar_url.clone();
		})
		.await;

		match updated {
			Ok(user) => {
				debug!(contact_key = %key, user_id = %user.id, "profile updated");
				Ok(user)
			}
			Err(StoreError::NotFound) => {
				let mut user = User::new(key.clone(), display_name, skill_tags);
				user.avatar_url = avatar_url;
				user.online = online;
				user.rev = self.store.insert_or_update_user(&user).await?;
				info!(contact_key = %key, user_id = %user.id, "user registered");
				metrics::counter!("pairhelp_server_users_registered_total").increment(1);
				Ok(user)
			}
			Err(e) => Err(e.into()),
		}
	}

	pub async fn user_by_key(&self, key: &ContactKey) -> Result<Option<User>, ServiceError> {
		Ok(self.store.find_user_by_contact_key(key).await?)
	}

	/// Persist a new `Open` question for a registered author.
	pub async fn submit(&self, author_key: &ContactKey, draft: QuestionDraft) -> Result<Question, ServiceError> {
		if draft.title.trim().is_empty() {
			return Err(ServiceError::InvalidRequest("question title is required".to_string()));
		}

		let Some(author) = self.store.find_user_by_contact_key(author_key).await? else {
			return Err(ServiceError::NotFound(format!("user {author_key}")));
		};

		let mut question = Question::open(&author, draft, unix_ms_now());
		let stored = self.store.insert_or_update_question(&question).await?;
		question.rev = stored.rev;

		info!(
			question_id = %question.id,
			author = %author_key,
			skill_tag = %question.skill_tag,
			"question submitted"
		);
		metrics::counter!("pairhelp_server_questions_submitted_total").increment(1);
		Ok(question)
	}

	/// One page of an author's question history.
	pub async fn list_by_author(
		&self,
		author_id: UserId,
		page_token: Option<&str>,
	) -> Result<(Vec<QuestionSummary>, Option<String>), ServiceError> {
		let token = match page_token.map(str::trim).filter(|t| !t.is_empty()) {
			Some(raw) => Some(
				raw.parse::<PageToken>()
					.map_err(|_| ServiceError::InvalidRequest(format!("invalid page token {raw:?}")))?,
			),
			None => None,
		};

		let page = self
			.store
			.find_questions_by_author(author_id, token, QUESTION_PAGE_SIZE)
			.await?;

		let summaries = page
			.docs
			.into_iter()
			.map(|q| QuestionSummary {
				id: q.id,
				title: q.title,
				state: q.state,
			})
			.collect();

		Ok((summaries, page.next_page_token.map(|t| t.to_string())))
	}

	/// Read-only view of an archived question.
	pub async fn view(&self, question_id: QuestionId) -> Result<ArchivedQuestion, ServiceError> {
		let Some(mut question) = self.store.find_question_by_id(question_id).await? else {
			return Err(ServiceError::NotFound(format!("question {question_id}")));
		};

		if !question.is_archived() {
			return Err(ServiceError::Unauthorized(format!(
				"question {question_id} is not archived"
			)));
		}

		if question.answer.is_none() {
			question.answer = Some(NO_ANSWER_PLACEHOLDER.to_string());
		}

		let helper_id = match question.helper.as_ref() {
			Some(key) => self.store.find_user_by_contact_key(key).await?.map(|u| u.id),
			None => None,
		};

		Ok(ArchivedQuestion { question, helper_id })
	}

	pub async fn profile(&self, user_id: UserId) -> Result<UserProfile, ServiceError> {
		match self.store.find_user_by_id(user_id).await? {
			Some(user) => Ok(profile_of(&user)),
			None => Err(ServiceError::NotFound(format!("user {user_id}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use pairhelp_domain::{Level, QuestionState};

	use super::*;
	use crate::store::MemoryRecordStore;

	fn service() -> (QuestionService, Arc<dyn RecordStore>) {
		let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
		(QuestionService::new(Arc::clone(&store), 3), store)
	}

	fn key(s: &str) -> ContactKey {
		ContactKey::new(s).expect("key")
	}

	fn draft(title: &str) -> QuestionDraft {
		QuestionDraft {
			title: title.to_string(),
			details: "details".to_string(),
			code: String::new(),
			skill_tag: SkillTag::new("rust").expect("tag"),
		}
	}

	#[test]
	fn skill_tags_are_normalized_and_deduped() {
		let tags = parse_skill_tags(["Rust", " go ", "rust"]).expect("tags");
		let names: Vec<&str> = tags.iter().map(SkillTag::as_str).collect();
		assert_eq!(names, vec!["rust", "go"]);

		assert!(matches!(parse_skill_tags(["  "]), Err(ServiceError::InvalidRequest(_))));
	}

	#[tokio::test]
	async fn register_creates_then_updates() {
		let (svc, store) = service();
		let tags = parse_skill_tags(["rust"]).expect("tags");

		let created = svc
			.register_profile(&key("a@x"), "Ann", tags.clone(), None, true)
			.await
			.expect("register");
		assert_eq!(created.helper_stats.level, Level::Beginner);
		assert_eq!(created.helper_stats.stars, 0);
		assert!(created.online);

		let updated = svc
			.register_profile(&key("a@x"), "Ann B", vec![], Some("http://img".into()), true)
			.await
			.expect("update");
		assert_eq!(updated.id, created.id);
		assert_eq!(updated.display_name, "Ann B");
		assert!(updated.skill_tags.is_empty());

		let stored = store
			.find_user_by_contact_key(&key("a@x"))
			.await
			.expect("find")
			.expect("present");
		assert_eq!(stored.rev, updated.rev);
		assert_eq!(stored.avatar_url.as_deref(), Some("http://img"));
	}

	#[tokio::test]
	async fn submit_requires_registered_author_and_title() {
		let (svc, _store) = service();

		let err = svc.submit(&key("nobody@x"), draft("t")).await.unwrap_err();
		assert!(matches!(err, ServiceError::NotFound(_)));

		svc.register_profile(&key("a@x"), "Ann", vec![], None, true)
			.await
			.expect("register");
		let err = svc.submit(&key("a@x"), draft("   ")).await.unwrap_err();
		assert!(matches!(err, ServiceError::InvalidRequest(_)));

		let q = svc.submit(&key("a@x"), draft("why")).await.expect("submit");
		assert_eq!(q.state, QuestionState::Open);
		assert_eq!(q.rev, 1);
		assert_eq!(q.author_name, "Ann");
	}

	#[tokio::test]
	async fn history_pages_through_tokens() {
		let (svc, _store) = service();
		let author = svc
			.register_profile(&key("a@x"), "Ann", vec![], None, true)
			.await
			.expect("register");
		for i in 0..12 {
			svc.submit(&key("a@x"), draft(&format!("q{i}"))).await.expect("submit");
		}

		let (first, token) = svc.list_by_author(author.id, None).await.expect("page 1");
		assert_eq!(first.len(), 10);
		let token = token.expect("more pages");

		let (second, token) = svc
			.list_by_author(author.id, Some(&token))
			.await
			.expect("page 2");
		assert_eq!(second.len(), 2);
		assert!(token.is_none());
		assert_eq!(second[1].title, "q11");

		let err = svc.list_by_author(author.id, Some("garbage")).await.unwrap_err();
		assert!(matches!(err, ServiceError::InvalidRequest(_)));
	}

	#[tokio::test]
	async fn view_only_serves_archived_questions() {
		let (svc, store) = service();
		let helper = svc
			.register_profile(&key("h@x"), "Hal", vec![], None, true)
			.await
			.expect("helper");
		svc.register_profile(&key("a@x"), "Ann", vec![], None, true)
			.await
			.expect("author");
		let mut q = svc.submit(&key("a@x"), draft("why")).await.expect("submit");

		let err = svc.view(q.id).await.unwrap_err();
		assert!(matches!(err, ServiceError::Unauthorized(_)));

		q.state = QuestionState::Archived;
		q.helper = Some(key("h@x"));
		store.insert_or_update_question(&q).await.expect("archive");

		let view = svc.view(q.id).await.expect("view");
		assert_eq!(view.helper_id, Some(helper.id));
		assert_eq!(view.question.answer.as_deref(), Some(NO_ANSWER_PLACEHOLDER));

		let err = svc.view(QuestionId::new_v4()).await.unwrap_err();
		assert!(matches!(err, ServiceError::NotFound(_)));
	}

	#[tokio::test]
	async fn profile_by_id() {
		let (svc, _store) = service();
		let user = svc
			.register_profile(&key("a@x"), "Ann", vec![], None, false)
			.await
			.expect("register");

		let profile = svc.profile(user.id).await.expect("profile");
		assert_eq!(profile.display_name, "Ann");

		let err = svc.profile(UserId::new_v4()).await.unwrap_err();
		assert!(matches!(err, ServiceError::NotFound(_)));
	}
}
